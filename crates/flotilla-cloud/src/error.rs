//! Runtime error categories for cloud and agent interactions.

use thiserror::Error;

/// Result type alias for CPI and agent operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors surfaced by the cloud provider or the VM agent.
///
/// These are runtime failures: inside a per-instance transition they are
/// captured into a failed task event and halt the job. Nothing here is
/// retried implicitly by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("cpi error: {0}")]
    Cpi(String),

    #[error("agent {agent_id} unreachable: {reason}")]
    AgentUnreachable { agent_id: String, reason: String },

    #[error("agent {agent_id} not ready after {waited_ms}ms")]
    AgentNotReady { agent_id: String, waited_ms: u64 },

    #[error("failed to attach disk {disk_cid} to vm {vm_cid}: {reason}")]
    DiskAttachmentFailed {
        vm_cid: String,
        disk_cid: String,
        reason: String,
    },

    #[error("compilation failed: {0}")]
    CompilationFailed(String),
}
