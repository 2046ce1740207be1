//! External collaborator seams — the cloud provider, the VM agent, and the
//! lock manager.
//!
//! The orchestrator core consumes these behind traits; production wiring
//! plugs in real adapters, tests plug in the scriptable fakes shipped here.

pub mod agent;
pub mod cpi;
pub mod error;
pub mod fake;
pub mod locks;

pub use agent::{AgentClient, AgentState, DrainKind, ErrandResult, JobState};
pub use cpi::CloudProvider;
pub use error::{CloudError, CloudResult};
pub use fake::{FakeAgent, FakeCloud};
pub use locks::{DeploymentLockGuard, LockError, LockManager, ReleaseLockGuard};
