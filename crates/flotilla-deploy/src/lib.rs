//! Deployment execution — from a parsed plan to a converged fleet.
//!
//! The deployer drives one apply end to end: acquire the deployment lock,
//! parse the manifest, prepare (diff desired against the store), reconcile
//! resource pools, roll out job updates canary-first in bounded batches,
//! and commit the result. Progress streams through the event log; failures
//! halt the owning job and propagate without implicit retries.
//!
//! # Components
//!
//! - **`config`** — orchestrator config file (`DEPLOY_CONFIG`)
//! - **`context`** — shared handles every updater needs
//! - **`prepare`** — the nine-step preparer and the instance diff
//! - **`pool`** — resource pool reconciliation (idle VM create/delete)
//! - **`instance`** — per-instance transition executor with watch windows
//! - **`job`** — the canary-then-batch job updater state machine
//! - **`multi`** — serial-aware scheduling of many job updaters
//! - **`deploy`** — the top-level apply with locks, commit, and finalizers

pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod instance;
pub mod job;
pub mod multi;
pub mod pool;
pub mod prepare;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::OrchestratorConfig;
pub use context::DeployContext;
pub use deploy::Deployer;
pub use error::{DeployError, DeployResult};
pub use instance::InstanceUpdater;
pub use job::{JobUpdater, JobUpdaterState};
pub use multi::MultiJobUpdater;
pub use pool::ResourcePoolUpdater;
pub use prepare::{Assembled, InstanceAction, InstancePlan, JobPlan, Preparer};
