//! Resource pool reconciliation.
//!
//! Per pool the invariant is `|idle| + |allocated| == size` with every idle
//! VM on the pool's stemcell. Idle VMs on a stale stemcell are deleted and
//! the shortfall is created fresh. Pools reconcile independently and in
//! parallel under the global concurrency cap; a single VM failure fails its
//! task and aborts the containing stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info};

use flotilla_manifest::ManifestValue;
use flotilla_plan::{Plan, StemcellId};
use flotilla_state::VmRecord;

use crate::context::DeployContext;
use crate::error::{DeployError, DeployResult};

const DELETE_STAGE: &str = "Deleting outdated idle VMs";
const CREATE_STAGE: &str = "Creating bound missing VMs";

/// Produces and destroys idle VMs to satisfy pool size and stemcell.
pub struct ResourcePoolUpdater<'a> {
    plan: &'a Plan,
    ctx: &'a DeployContext,
}

struct CreateItem {
    pool: String,
    sequence: usize,
    stemcell: StemcellId,
    cloud_properties: ManifestValue,
    networks: ManifestValue,
}

impl<'a> ResourcePoolUpdater<'a> {
    pub fn new(plan: &'a Plan, ctx: &'a DeployContext) -> Self {
        Self { plan, ctx }
    }

    pub async fn update(&self) -> DeployResult<()> {
        let (stale, missing) = self.reconciliation_work()?;

        if !stale.is_empty() {
            self.delete_stale(stale).await?;
        }
        if !missing.is_empty() {
            self.create_missing(missing).await?;
        }
        Ok(())
    }

    /// Figure out, per pool, which idle VMs are outdated and how many VMs
    /// are missing against the pool size.
    fn reconciliation_work(&self) -> DeployResult<(Vec<VmRecord>, Vec<CreateItem>)> {
        let mut stale = Vec::new();
        let mut missing = Vec::new();

        let all_vms = self.ctx.store.list_vms(&self.plan.name)?;
        for pool in &self.plan.resource_pools {
            let idle: Vec<&VmRecord> = all_vms
                .iter()
                .filter(|v| v.resource_pool == pool.name && v.is_idle())
                .collect();
            let idle_count = idle.len();
            let (outdated, fresh): (Vec<&VmRecord>, Vec<&VmRecord>) =
                idle.into_iter().partition(|v| v.stemcell != pool.stemcell);
            let allocated = all_vms
                .iter()
                .filter(|v| v.resource_pool == pool.name && !v.is_idle())
                .count();

            let shortfall = (pool.size as usize).saturating_sub(fresh.len() + allocated);
            debug!(
                pool = %pool.name,
                size = pool.size,
                allocated,
                idle = idle_count,
                outdated = outdated.len(),
                shortfall,
                "pool reconciliation computed"
            );

            stale.extend(outdated.into_iter().cloned());
            let network = &self.plan.networks[pool.network];
            for sequence in 0..shortfall {
                missing.push(CreateItem {
                    pool: pool.name.clone(),
                    sequence,
                    stemcell: pool.stemcell.clone(),
                    cloud_properties: pool.cloud_properties.clone(),
                    networks: json!([{
                        "name": network.name,
                        "cloud_properties": network.cloud_properties,
                    }]),
                });
            }
        }
        Ok((stale, missing))
    }

    async fn delete_stale(&self, stale: Vec<VmRecord>) -> DeployResult<()> {
        let stage = self.ctx.events.begin_stage(DELETE_STAGE, stale.len() as u32);
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();

        for vm in stale {
            let task = stage.task(format!("{} ({})", vm.cid, vm.resource_pool));
            let ctx = self.ctx.clone();
            let aborted = aborted.clone();
            tasks.spawn(async move {
                let _permit = ctx
                    .limits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DeployError::InvariantViolated("global limit closed".into()))?;
                if aborted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                task.started();
                let result: DeployResult<()> = async {
                    ctx.cloud.delete_vm(&vm.cid).await?;
                    ctx.store.delete_vm(&vm.cid)?;
                    Ok(())
                }
                .await;
                match result {
                    Ok(()) => {
                        task.finished();
                        Ok(())
                    }
                    Err(error) => {
                        aborted.store(true, Ordering::SeqCst);
                        task.failed(&error.to_string());
                        Err(error)
                    }
                }
            });
        }

        let result = drain(&mut tasks).await;
        if result.is_ok() {
            info!(stage = DELETE_STAGE, "outdated idle VMs deleted");
        }
        result
    }

    async fn create_missing(&self, missing: Vec<CreateItem>) -> DeployResult<()> {
        let stage = self.ctx.events.begin_stage(CREATE_STAGE, missing.len() as u32);
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();

        for item in missing {
            let task = stage.task(format!("{}/{}", item.pool, item.sequence));
            let ctx = self.ctx.clone();
            let deployment = self.plan.name.clone();
            let aborted = aborted.clone();
            tasks.spawn(async move {
                let _permit = ctx
                    .limits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DeployError::InvariantViolated("global limit closed".into()))?;
                if aborted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                task.started();
                let result: DeployResult<()> = async {
                    let cid = ctx
                        .cloud
                        .create_vm(&item.stemcell, &item.cloud_properties, &item.networks, &[])
                        .await?;
                    ctx.store.put_vm(&VmRecord {
                        cid: cid.clone(),
                        agent_id: format!("agent-{cid}"),
                        deployment,
                        resource_pool: item.pool.clone(),
                        stemcell: item.stemcell.clone(),
                        owner: None,
                        created_at: ctx.clock.now_secs(),
                    })?;
                    Ok(())
                }
                .await;
                match result {
                    Ok(()) => {
                        task.finished();
                        Ok(())
                    }
                    Err(error) => {
                        aborted.store(true, Ordering::SeqCst);
                        task.failed(&error.to_string());
                        Err(error)
                    }
                }
            });
        }

        let result = drain(&mut tasks).await;
        if result.is_ok() {
            info!(stage = CREATE_STAGE, "missing pool VMs created");
        }
        result
    }
}

/// Wait for every spawned task, reporting the first error.
async fn drain(tasks: &mut JoinSet<DeployResult<()>>) -> DeployResult<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(DeployError::InvariantViolated(format!(
                        "pool task panicked: {join_error}"
                    )));
                }
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, sample_plan};
    use flotilla_cloud::CloudError;
    use flotilla_eventlog::TaskState;

    fn idle_vm(cid: &str, version: &str, owner: Option<flotilla_state::VmOwner>) -> VmRecord {
        VmRecord {
            cid: cid.to_string(),
            agent_id: format!("agent-{cid}"),
            deployment: "prod".to_string(),
            resource_pool: "small".to_string(),
            stemcell: StemcellId {
                name: "ubuntu".to_string(),
                version: version.to_string(),
            },
            owner,
            created_at: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fills_pool_to_size() {
        let h = harness();
        let plan = sample_plan();

        ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap();

        // Pool size 8, nothing allocated: eight fresh idle VMs.
        assert_eq!(h.cloud.calls("create_vm").len(), 8);
        let idle = h.ctx.store.list_idle_vms("prod", "small").unwrap();
        assert_eq!(idle.len(), 8);
        assert!(idle.iter().all(|v| v.stemcell.version == "3586"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaces_stale_idle_vms() {
        let h = harness();
        let plan = sample_plan();
        h.ctx.store.put_vm(&idle_vm("vm-old", "3000", None)).unwrap();
        h.ctx.store.put_vm(&idle_vm("vm-ok", "3586", None)).unwrap();

        ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap();

        assert_eq!(h.cloud.calls("delete_vm"), vec!["vm-old"]);
        // One fresh idle survives, seven created to reach size 8.
        assert_eq!(h.cloud.calls("create_vm").len(), 7);
        assert!(h.ctx.store.get_vm("vm-old").unwrap().is_none());
        assert_eq!(h.ctx.store.list_idle_vms("prod", "small").unwrap().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn counts_allocated_vms_toward_size() {
        let h = harness();
        let plan = sample_plan();
        for index in 0..3 {
            h.ctx
                .store
                .put_vm(&idle_vm(
                    &format!("vm-web-{index}"),
                    "3586",
                    Some(flotilla_state::VmOwner {
                        job: "web".to_string(),
                        index,
                    }),
                ))
                .unwrap();
        }

        ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap();

        // 8 - 3 allocated = 5 idle to create.
        assert_eq!(h.cloud.calls("create_vm").len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn satisfied_pool_is_a_noop() {
        let mut h = harness();
        let plan = sample_plan();
        for i in 0..8 {
            h.ctx.store.put_vm(&idle_vm(&format!("vm-{i}"), "3586", None)).unwrap();
        }

        ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap();

        assert!(h.cloud.calls("create_vm").is_empty());
        assert!(h.cloud.calls("delete_vm").is_empty());
        // No stage events at all.
        assert!(h.stream.try_drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_failure_fails_task_and_stage() {
        let mut h = harness();
        let plan = sample_plan();
        h.cloud
            .fail_on("create_vm", "*", CloudError::Cpi("quota exceeded".into()));

        let err = ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap_err();
        assert!(matches!(err, DeployError::Cloud(CloudError::Cpi(_))));

        let events = h.stream.try_drain();
        assert!(events
            .iter()
            .any(|e| e.stage == CREATE_STAGE && e.state == TaskState::Failed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_creation_stage_events() {
        let mut h = harness();
        let plan = sample_plan();

        ResourcePoolUpdater::new(&plan, &h.ctx).update().await.unwrap();

        let events = h.stream.try_drain();
        let create_events: Vec<_> = events.iter().filter(|e| e.stage == CREATE_STAGE).collect();
        assert!(create_events.iter().all(|e| e.total == 8));
        let finished = create_events
            .iter()
            .filter(|e| e.state == TaskState::Finished)
            .count();
        assert_eq!(finished, 8);
        assert!(create_events.iter().any(|e| e.task == "small/0"));
    }
}
