//! Fleet state store — redb-backed persistence for flotilla.
//!
//! Records deployments, published release versions, stemcell references,
//! instances, VMs, and persistent disks. All values are JSON-serialized into
//! redb's `&[u8]` value columns; multi-row updates (the deployment commit,
//! stemcell reference reconciliation, job renames) run inside single write
//! transactions.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
