//! Per-instance transition executor.
//!
//! Drives one instance through `PLANNED → STOPPING → APPLYING → STARTING →
//! WATCHING → DONE`. Every path is idempotent end to end: re-running a
//! transition against a half-converged instance converges it. VM ownership
//! moves between the instance and its resource pool's idle set; persistent
//! disk records survive VM replacement.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use flotilla_cloud::{CloudError, DrainKind};
use flotilla_plan::{TargetState, WatchTime};
use flotilla_state::{DiskRecord, InstanceLifecycle, InstanceRecord, VmOwner, VmRecord};

use crate::context::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::prepare::{InstanceAction, InstancePlan};

/// Executes one instance transition against the cloud, the agent, and the
/// store.
#[derive(Clone)]
pub struct InstanceUpdater {
    ctx: DeployContext,
    deployment: String,
}

impl InstanceUpdater {
    pub fn new(ctx: DeployContext, deployment: String) -> Self {
        Self { ctx, deployment }
    }

    /// Run the planned transition, polling readiness within `watch`.
    pub async fn run(&self, plan: &InstancePlan, watch: WatchTime) -> DeployResult<()> {
        debug!(
            job = %plan.job,
            index = plan.index,
            action = ?plan.action,
            target = ?plan.target_state,
            "instance transition starting"
        );
        match plan.action {
            InstanceAction::Noop => Ok(()),
            InstanceAction::Delete => self.delete(plan).await,
            InstanceAction::Create => self.create(plan, watch).await,
            InstanceAction::Update => self.update(plan, watch).await,
            InstanceAction::Recreate => self.recreate(plan, watch).await,
        }
    }

    async fn delete(&self, plan: &InstancePlan) -> DeployResult<()> {
        if let Some(record) = &plan.existing {
            if let Some(vm) = self.vm_of(record)? {
                self.ctx.agent.drain(&vm.agent_id, DrainKind::Shutdown).await?;
                self.ctx.agent.stop(&vm.agent_id).await?;
                if let Some(disk_cid) = &record.disk_cid {
                    self.ctx.cloud.detach_disk(&vm.cid, disk_cid).await?;
                    self.orphan_disk(disk_cid)?;
                }
                self.ctx.cloud.delete_vm(&vm.cid).await?;
                self.ctx.store.delete_vm(&vm.cid)?;
            }
            self.ctx
                .store
                .delete_instance(&record.deployment, &record.job, record.index)?;
            info!(job = %plan.job, index = plan.index, "instance deleted");
        }
        Ok(())
    }

    async fn create(&self, plan: &InstancePlan, watch: WatchTime) -> DeployResult<()> {
        if plan.target_state == TargetState::Detached {
            // Nothing to run; record the slot so a later state change
            // materializes it.
            self.write_record(plan, InstanceLifecycle::Detached, None, None)?;
            return Ok(());
        }

        let vm = self.acquire_vm(plan).await?;
        let disk = self.ensure_disk(plan, &vm).await?;
        self.apply_spec(plan, &vm).await?;

        let state = match plan.target_state {
            TargetState::Started => {
                self.ctx.agent.start(&vm.agent_id).await?;
                self.watch_until_running(&vm.agent_id, watch).await?;
                InstanceLifecycle::Started
            }
            TargetState::Stopped => {
                self.ctx.agent.stop(&vm.agent_id).await?;
                InstanceLifecycle::Stopped
            }
            TargetState::Detached => InstanceLifecycle::Detached,
        };

        self.write_record(plan, state, Some(vm.cid.clone()), disk.map(|d| d.cid))?;
        info!(job = %plan.job, index = plan.index, vm = %vm.cid, "instance created");
        Ok(())
    }

    async fn update(&self, plan: &InstancePlan, watch: WatchTime) -> DeployResult<()> {
        let Some(record) = &plan.existing else {
            return self.create(plan, watch).await;
        };
        let Some(vm) = self.vm_of(record)? else {
            // Record exists but the VM is gone (e.g. previously detached).
            return self.create(plan, watch).await;
        };

        match plan.target_state {
            TargetState::Started => {
                self.ctx.agent.drain(&vm.agent_id, DrainKind::Update).await?;
                self.ctx.agent.stop(&vm.agent_id).await?;
                let disk = self.ensure_disk(plan, &vm).await?;
                self.apply_spec(plan, &vm).await?;
                self.ctx.agent.start(&vm.agent_id).await?;
                self.watch_until_running(&vm.agent_id, watch).await?;
                self.write_record(
                    plan,
                    InstanceLifecycle::Started,
                    Some(vm.cid.clone()),
                    disk.map(|d| d.cid),
                )?;
            }
            TargetState::Stopped => {
                self.ctx.agent.drain(&vm.agent_id, DrainKind::Shutdown).await?;
                self.ctx.agent.stop(&vm.agent_id).await?;
                // VM and disk are retained; the running spec is unchanged,
                // so the stored digests stay as they were.
                let mut stopped = record.clone();
                stopped.state = InstanceLifecycle::Stopped;
                stopped.updated_at = self.ctx.clock.now_secs();
                self.ctx.store.put_instance(&stopped)?;
            }
            TargetState::Detached => {
                self.ctx.agent.drain(&vm.agent_id, DrainKind::Shutdown).await?;
                self.ctx.agent.stop(&vm.agent_id).await?;
                if let Some(disk_cid) = &record.disk_cid {
                    self.ctx.cloud.detach_disk(&vm.cid, disk_cid).await?;
                }
                self.ctx.cloud.delete_vm(&vm.cid).await?;
                self.ctx.store.delete_vm(&vm.cid)?;
                let mut detached = record.clone();
                detached.state = InstanceLifecycle::Detached;
                detached.vm_cid = None;
                detached.updated_at = self.ctx.clock.now_secs();
                self.ctx.store.put_instance(&detached)?;
            }
        }
        info!(job = %plan.job, index = plan.index, "instance updated");
        Ok(())
    }

    async fn recreate(&self, plan: &InstancePlan, watch: WatchTime) -> DeployResult<()> {
        if let Some(record) = &plan.existing {
            if let Some(vm) = self.vm_of(record)? {
                self.ctx.agent.drain(&vm.agent_id, DrainKind::Shutdown).await?;
                self.ctx.agent.stop(&vm.agent_id).await?;
                if let Some(disk_cid) = &record.disk_cid {
                    self.ctx.cloud.detach_disk(&vm.cid, disk_cid).await?;
                }
                self.ctx.cloud.delete_vm(&vm.cid).await?;
                self.ctx.store.delete_vm(&vm.cid)?;
            }
        }
        // From here recreation is creation with any surviving disk
        // re-attached by ensure_disk.
        self.create(plan, watch).await
    }

    // ── Building blocks ────────────────────────────────────────────

    /// Take an idle VM with the right stemcell from the pool, or have the
    /// cloud create one. Either way the instance owns it afterwards.
    async fn acquire_vm(&self, plan: &InstancePlan) -> DeployResult<VmRecord> {
        let owner = VmOwner {
            job: plan.job.clone(),
            index: plan.index,
        };

        if let Some(vm) =
            self.ctx
                .store
                .claim_idle_vm(&self.deployment, &plan.pool, &plan.stemcell, &owner)?
        {
            debug!(vm = %vm.cid, job = %plan.job, index = plan.index, "idle VM bound");
            return Ok(vm);
        }

        let cid = self
            .ctx
            .cloud
            .create_vm(&plan.stemcell, &plan.cloud_properties, &plan.networks, &[])
            .await?;
        let vm = VmRecord {
            cid: cid.clone(),
            agent_id: format!("agent-{cid}"),
            deployment: self.deployment.clone(),
            resource_pool: plan.pool.clone(),
            stemcell: plan.stemcell.clone(),
            owner: Some(owner),
            created_at: self.ctx.clock.now_secs(),
        };
        self.ctx.store.put_vm(&vm)?;
        Ok(vm)
    }

    /// Make sure the instance's persistent disk exists and is attached.
    async fn ensure_disk(
        &self,
        plan: &InstancePlan,
        vm: &VmRecord,
    ) -> DeployResult<Option<DiskRecord>> {
        if plan.disk_size_mb == 0 {
            return Ok(None);
        }

        if let Some(disk) = self
            .ctx
            .store
            .find_active_disk(&self.deployment, &plan.job, plan.index)?
        {
            self.ctx.cloud.attach_disk(&vm.cid, &disk.cid).await?;
            return Ok(Some(disk));
        }

        let cid = self
            .ctx
            .cloud
            .create_disk(plan.disk_size_mb, &plan.cloud_properties)
            .await?;
        let disk = DiskRecord {
            cid: cid.clone(),
            deployment: self.deployment.clone(),
            job: plan.job.clone(),
            index: plan.index,
            size_mb: plan.disk_size_mb,
            active: true,
            created_at: self.ctx.clock.now_secs(),
        };
        self.ctx.store.put_disk(&disk)?;
        self.ctx.cloud.attach_disk(&vm.cid, &cid).await?;
        Ok(Some(disk))
    }

    async fn apply_spec(&self, plan: &InstancePlan, vm: &VmRecord) -> DeployResult<()> {
        let mut spec = plan.spec.clone();
        spec["index"] = json!(plan.index);
        self.ctx.agent.apply(&vm.agent_id, &spec).await?;
        Ok(())
    }

    /// Poll the agent for `running` inside the watch window: first poll at
    /// `min`, then at an interval that fits at least three polls, hard
    /// failure at `max`.
    async fn watch_until_running(&self, agent_id: &str, watch: WatchTime) -> DeployResult<()> {
        let started = std::time::Instant::now();
        let deadline = Duration::from_millis(watch.max_ms);
        let interval =
            Duration::from_millis(((watch.max_ms.saturating_sub(watch.min_ms)) / 3).max(1));

        tokio::time::sleep(Duration::from_millis(watch.min_ms)).await;
        loop {
            let state = self.ctx.agent.get_state(agent_id).await?;
            if state.is_running() {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(DeployError::Cloud(CloudError::AgentNotReady {
                    agent_id: agent_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                }));
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn vm_of(&self, record: &InstanceRecord) -> DeployResult<Option<VmRecord>> {
        match &record.vm_cid {
            Some(cid) => Ok(self.ctx.store.get_vm(cid)?),
            None => Ok(None),
        }
    }

    fn orphan_disk(&self, disk_cid: &str) -> DeployResult<()> {
        if let Some(mut disk) = self.ctx.store.get_disk(disk_cid)? {
            disk.active = false;
            self.ctx.store.put_disk(&disk)?;
        }
        Ok(())
    }

    fn write_record(
        &self,
        plan: &InstancePlan,
        state: InstanceLifecycle,
        vm_cid: Option<String>,
        disk_cid: Option<String>,
    ) -> DeployResult<()> {
        self.ctx.store.put_instance(&InstanceRecord {
            deployment: self.deployment.clone(),
            job: plan.job.clone(),
            index: plan.index,
            state,
            vm_cid,
            disk_cid,
            spec_digest: plan.spec_digest.clone(),
            network_digest: plan.network_digest.clone(),
            updated_at: self.ctx.clock.now_secs(),
        })?;
        Ok(())
    }
}
