//! VM agent RPC interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flotilla_manifest::ManifestValue;

use crate::error::CloudResult;

/// What the agent is asked to drain for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainKind {
    /// The VM is going away (stop, detach, recreate).
    Shutdown,
    /// The job is being updated in place.
    Update,
}

/// Job state as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Starting,
    Stopped,
    Failing,
    Unknown,
}

/// Agent state snapshot returned by `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub job_state: JobState,
}

impl AgentState {
    pub fn is_running(&self) -> bool {
        self.job_state == JobState::Running
    }
}

/// Output of an errand run on the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// RPC client for the agent running inside each VM.
///
/// All calls are addressed by `agent_id`; request/response with no implicit
/// retries.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Stage a spec on the agent without activating it.
    async fn prepare(&self, agent_id: &str, spec: &ManifestValue) -> CloudResult<()>;

    /// Activate a staged or new spec.
    async fn apply(&self, agent_id: &str, spec: &ManifestValue) -> CloudResult<()>;

    async fn start(&self, agent_id: &str) -> CloudResult<()>;

    async fn stop(&self, agent_id: &str) -> CloudResult<()>;

    /// Quiesce the job before stop/shutdown.
    async fn drain(&self, agent_id: &str, kind: DrainKind) -> CloudResult<()>;

    async fn get_state(&self, agent_id: &str) -> CloudResult<AgentState>;

    async fn run_errand(&self, agent_id: &str) -> CloudResult<ErrandResult>;
}
