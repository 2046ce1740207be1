//! Deployment error types.

use thiserror::Error;

use flotilla_cloud::{CloudError, LockError};
use flotilla_plan::PlanError;
use flotilla_state::StateError;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced by an apply.
///
/// Validation errors abort before any state mutation. Runtime errors are
/// captured into failed task events and halt the owning job. Nothing is
/// retried implicitly; retry belongs to whoever invoked the orchestrator.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] PlanError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Store(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("job {job} halted: {reason}")]
    Halted { job: String, reason: String },

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("invalid orchestrator config: {0}")]
    Config(String),
}

impl DeployError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled)
    }
}
