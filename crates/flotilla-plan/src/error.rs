//! Plan construction error types.

use flotilla_manifest::ManifestError;
use thiserror::Error;

/// Result type alias for plan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised while turning a manifest into a plan.
///
/// All of these are validation failures: they abort the apply before any
/// state is mutated.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("unknown release: {release}")]
    UnknownRelease { release: String },

    #[error("job {job}: unknown resource pool {pool}")]
    UnknownResourcePool { job: String, pool: String },

    #[error("{job}: unknown network {network}")]
    UnknownNetwork { job: String, network: String },

    #[error("job {job}: invalid templates: {reason}")]
    InvalidTemplates { job: String, reason: String },

    #[error("job {job}: incompatible template property specs")]
    IncompatibleSpecs { job: String },

    #[error("job {job}: missing required property {path}")]
    MissingProperty { job: String, path: String },

    #[error("job {job}: invalid property mapping {alias} -> {source_path}: source path not found")]
    InvalidPropertyMapping {
        job: String,
        alias: String,
        source_path: String,
    },

    #[error("resource pool {pool} is over capacity: jobs need {needed} instances, pool size is {size}")]
    PoolCapacityExceeded {
        pool: String,
        needed: u32,
        size: u32,
    },
}

impl PlanError {
    pub fn invalid_templates(job: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::InvalidTemplates {
            job: job.into(),
            reason: reason.into(),
        }
    }
}
