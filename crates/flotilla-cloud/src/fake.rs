//! Scriptable in-memory doubles for the CPI and the agent.
//!
//! Both fakes journal every call in order and can be programmed to fail
//! specific operations on specific targets. The agent fake additionally
//! gauges concurrent `apply` calls so rollout tests can assert in-flight
//! ceilings, and can delay readiness to exercise watch windows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use flotilla_manifest::ManifestValue;
use flotilla_plan::StemcellId;

use crate::agent::{AgentClient, AgentState, DrainKind, ErrandResult, JobState};
use crate::cpi::CloudProvider;
use crate::error::{CloudError, CloudResult};

/// One journaled call: operation name plus its primary target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub op: String,
    pub target: String,
}

#[derive(Default)]
struct Journal {
    calls: Vec<CallRecord>,
    failures: HashMap<(String, String), CloudError>,
}

impl Journal {
    fn record(&mut self, op: &str, target: &str) -> Option<CloudError> {
        self.calls.push(CallRecord {
            op: op.to_string(),
            target: target.to_string(),
        });
        self.failures.get(&(op.to_string(), target.to_string())).cloned()
    }
}

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── FakeCloud ──────────────────────────────────────────────────────

/// In-memory cloud provider double.
#[derive(Default)]
pub struct FakeCloud {
    journal: Mutex<Journal>,
    next_id: AtomicU64,
    vms: Mutex<Vec<String>>,
    disks: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program every future `op` call against `target` to fail.
    /// Use `"*"` as the target to fail the op regardless of argument.
    pub fn fail_on(&self, op: &str, target: &str, error: CloudError) {
        guard(&self.journal)
            .failures
            .insert((op.to_string(), target.to_string()), error);
    }

    /// All journaled calls, in order.
    pub fn journal(&self) -> Vec<CallRecord> {
        guard(&self.journal).calls.clone()
    }

    /// Targets of all calls of one operation, in order.
    pub fn calls(&self, op: &str) -> Vec<String> {
        guard(&self.journal)
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Cloud IDs of VMs that currently exist.
    pub fn live_vms(&self) -> Vec<String> {
        guard(&self.vms).clone()
    }

    /// Cloud IDs of disks that currently exist.
    pub fn live_disks(&self) -> Vec<String> {
        guard(&self.disks).clone()
    }

    fn check(&self, op: &str, target: &str) -> CloudResult<()> {
        let mut journal = guard(&self.journal);
        if let Some(error) = journal.record(op, target) {
            return Err(error);
        }
        if let Some(error) = journal
            .failures
            .get(&(op.to_string(), "*".to_string()))
            .cloned()
        {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_vm(
        &self,
        stemcell: &StemcellId,
        _cloud_properties: &ManifestValue,
        _networks: &ManifestValue,
        _disk_cids: &[String],
    ) -> CloudResult<String> {
        self.check("create_vm", &stemcell.to_string())?;
        let cid = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        guard(&self.vms).push(cid.clone());
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()> {
        self.check("delete_vm", vm_cid)?;
        guard(&self.vms).retain(|cid| cid != vm_cid);
        Ok(())
    }

    async fn create_disk(
        &self,
        size_mb: u64,
        _cloud_properties: &ManifestValue,
    ) -> CloudResult<String> {
        self.check("create_disk", &size_mb.to_string())?;
        let cid = format!("disk-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        guard(&self.disks).push(cid.clone());
        Ok(cid)
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.check("attach_disk", &format!("{vm_cid}:{disk_cid}"))?;
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.check("detach_disk", &format!("{vm_cid}:{disk_cid}"))?;
        Ok(())
    }

    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String> {
        self.check("snapshot_disk", disk_cid)?;
        Ok(format!("snap-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

// ── FakeAgent ──────────────────────────────────────────────────────

#[derive(Default)]
struct AgentScript {
    /// get_state calls to answer `Starting` before reporting `Running`.
    not_ready_polls: HashMap<String, u32>,
    /// Fixed job state per agent (overrides the default `Running`).
    states: HashMap<String, JobState>,
}

/// In-memory agent RPC double.
#[derive(Default)]
pub struct FakeAgent {
    journal: Mutex<Journal>,
    script: Mutex<AgentScript>,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    /// How long `apply` lingers, to make concurrent applies observable.
    apply_delay: Mutex<Duration>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            apply_delay: Mutex::new(Duration::from_millis(20)),
            ..Self::default()
        }
    }

    /// Program every future `op` call against `agent_id` to fail.
    /// Use `"*"` as the agent to fail the op regardless of argument.
    pub fn fail_on(&self, op: &str, agent_id: &str, error: CloudError) {
        guard(&self.journal)
            .failures
            .insert((op.to_string(), agent_id.to_string()), error);
    }

    /// Answer the first `polls` get_state calls for `agent_id` with
    /// `Starting` before reporting `Running`.
    pub fn ready_after(&self, agent_id: &str, polls: u32) {
        guard(&self.script)
            .not_ready_polls
            .insert(agent_id.to_string(), polls);
    }

    /// Pin the reported job state for an agent.
    pub fn set_state(&self, agent_id: &str, state: JobState) {
        guard(&self.script)
            .states
            .insert(agent_id.to_string(), state);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *guard(&self.apply_delay) = delay;
    }

    pub fn journal(&self) -> Vec<CallRecord> {
        guard(&self.journal).calls.clone()
    }

    pub fn calls(&self, op: &str) -> Vec<String> {
        guard(&self.journal)
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Largest number of `apply` calls ever in flight at once.
    pub fn max_concurrent_applies(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str, agent_id: &str) -> CloudResult<()> {
        let mut journal = guard(&self.journal);
        if let Some(error) = journal.record(op, agent_id) {
            return Err(error);
        }
        if let Some(error) = journal
            .failures
            .get(&(op.to_string(), "*".to_string()))
            .cloned()
        {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn prepare(&self, agent_id: &str, _spec: &ManifestValue) -> CloudResult<()> {
        self.check("prepare", agent_id)
    }

    async fn apply(&self, agent_id: &str, _spec: &ManifestValue) -> CloudResult<()> {
        self.check("apply", agent_id)?;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *guard(&self.apply_delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, agent_id: &str) -> CloudResult<()> {
        self.check("start", agent_id)
    }

    async fn stop(&self, agent_id: &str) -> CloudResult<()> {
        self.check("stop", agent_id)
    }

    async fn drain(&self, agent_id: &str, kind: DrainKind) -> CloudResult<()> {
        let op = match kind {
            DrainKind::Shutdown => "drain(shutdown)",
            DrainKind::Update => "drain(update)",
        };
        self.check(op, agent_id)
    }

    async fn get_state(&self, agent_id: &str) -> CloudResult<AgentState> {
        self.check("get_state", agent_id)?;
        let mut script = guard(&self.script);
        if let Some(polls) = script.not_ready_polls.get_mut(agent_id) {
            if *polls > 0 {
                *polls -= 1;
                return Ok(AgentState {
                    job_state: JobState::Starting,
                });
            }
        }
        let state = script
            .states
            .get(agent_id)
            .copied()
            .unwrap_or(JobState::Running);
        Ok(AgentState { job_state: state })
    }

    async fn run_errand(&self, agent_id: &str) -> CloudResult<ErrandResult> {
        self.check("run_errand", agent_id)?;
        Ok(ErrandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stemcell() -> StemcellId {
        StemcellId {
            name: "ubuntu".into(),
            version: "3586".into(),
        }
    }

    #[tokio::test]
    async fn cloud_creates_and_deletes_vms() {
        let cloud = FakeCloud::new();
        let cid = cloud
            .create_vm(&stemcell(), &json!({}), &json!({}), &[])
            .await
            .unwrap();
        assert_eq!(cloud.live_vms(), vec![cid.clone()]);

        cloud.delete_vm(&cid).await.unwrap();
        assert!(cloud.live_vms().is_empty());
        assert_eq!(cloud.calls("create_vm").len(), 1);
        assert_eq!(cloud.calls("delete_vm"), vec![cid]);
    }

    #[tokio::test]
    async fn cloud_programmed_failure_fires() {
        let cloud = FakeCloud::new();
        cloud.fail_on("create_vm", "*", CloudError::Cpi("quota exceeded".into()));

        let err = cloud
            .create_vm(&stemcell(), &json!({}), &json!({}), &[])
            .await
            .unwrap_err();
        assert_eq!(err, CloudError::Cpi("quota exceeded".into()));
        // The failed call is still journaled.
        assert_eq!(cloud.calls("create_vm").len(), 1);
    }

    #[tokio::test]
    async fn agent_defaults_to_running() {
        let agent = FakeAgent::new();
        let state = agent.get_state("agent-1").await.unwrap();
        assert!(state.is_running());
    }

    #[tokio::test]
    async fn agent_ready_after_counts_down() {
        let agent = FakeAgent::new();
        agent.ready_after("agent-1", 2);

        assert!(!agent.get_state("agent-1").await.unwrap().is_running());
        assert!(!agent.get_state("agent-1").await.unwrap().is_running());
        assert!(agent.get_state("agent-1").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn agent_failure_targets_one_agent() {
        let agent = FakeAgent::new();
        agent.fail_on(
            "start",
            "agent-1",
            CloudError::AgentUnreachable {
                agent_id: "agent-1".into(),
                reason: "timeout".into(),
            },
        );

        assert!(agent.start("agent-1").await.is_err());
        assert!(agent.start("agent-2").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_gauge_observes_concurrency() {
        let agent = std::sync::Arc::new(FakeAgent::new());

        let mut handles = Vec::new();
        for i in 0..3 {
            let agent = agent.clone();
            handles.push(tokio::spawn(async move {
                agent.apply(&format!("agent-{i}"), &json!({})).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(agent.max_concurrent_applies() >= 2);
    }

    #[tokio::test]
    async fn drain_kinds_journal_separately() {
        let agent = FakeAgent::new();
        agent.drain("agent-1", DrainKind::Shutdown).await.unwrap();
        agent.drain("agent-1", DrainKind::Update).await.unwrap();

        assert_eq!(agent.calls("drain(shutdown)"), vec!["agent-1"]);
        assert_eq!(agent.calls("drain(update)"), vec!["agent-1"]);
    }
}
