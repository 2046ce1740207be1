//! The preparer: bind store records to the plan and diff desired vs actual.
//!
//! Advertises the nine-step "Preparing deployment" stage, migrates renamed
//! jobs, and classifies every instance slot as create, update, recreate,
//! delete, or noop.

use serde_json::json;
use tracing::{debug, info};

use flotilla_manifest::ManifestValue;
use flotilla_plan::{spec_digest, Job, Plan, StemcellId, TargetState, UpdateConfig};
use flotilla_state::{InstanceLifecycle, InstanceRecord};

use crate::context::DeployContext;
use crate::error::DeployResult;

/// What has to happen to one instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Create,
    Update,
    Recreate,
    Delete,
    Noop,
}

/// One instance transition, self-contained so it can cross task boundaries.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub job: String,
    pub index: u32,
    pub action: InstanceAction,
    pub target_state: TargetState,
    /// The full spec applied to the agent.
    pub spec: ManifestValue,
    pub spec_digest: String,
    pub network_digest: String,
    pub pool: String,
    pub stemcell: StemcellId,
    pub cloud_properties: ManifestValue,
    /// Network settings handed to the CPI and embedded in the spec.
    pub networks: ManifestValue,
    pub disk_size_mb: u64,
    pub existing: Option<InstanceRecord>,
}

/// A job's rollout work: its update config plus the per-instance plans.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub name: String,
    pub update: UpdateConfig,
    pub instances: Vec<InstancePlan>,
}

impl JobPlan {
    /// Instances that actually need work (everything but noops).
    pub fn changed(&self) -> Vec<InstancePlan> {
        self.instances
            .iter()
            .filter(|i| i.action != InstanceAction::Noop)
            .cloned()
            .collect()
    }
}

/// Output of the preparer, in manifest job order. Jobs that disappeared
/// from the manifest surface as trailing delete-only entries.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub jobs: Vec<JobPlan>,
}

impl Assembled {
    pub fn job(&self, name: &str) -> Option<&JobPlan> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

const PREPARE_STEPS: [&str; 9] = [
    "Binding deployment",
    "Binding releases",
    "Binding existing deployment",
    "Binding resource pools",
    "Binding stemcells",
    "Binding templates",
    "Binding properties",
    "Binding unallocated VMs",
    "Binding instance networks",
];

/// Binds existing VM/disk records to planned instances and builds the
/// difference classification.
pub struct Preparer<'a> {
    plan: &'a Plan,
    ctx: &'a DeployContext,
}

impl<'a> Preparer<'a> {
    pub fn new(plan: &'a Plan, ctx: &'a DeployContext) -> Self {
        Self { plan, ctx }
    }

    pub async fn prepare(&self) -> DeployResult<Assembled> {
        let stage = self
            .ctx
            .events
            .begin_stage("Preparing deployment", PREPARE_STEPS.len() as u32);

        let step = |name: &str| {
            let task = stage.task(name);
            task.started();
            task
        };

        // Binding deployment: migrate renamed jobs before any lookups.
        let task = step(PREPARE_STEPS[0]);
        for job in &self.plan.jobs {
            if let Some(old) = &job.rename_from {
                let migrated = self.ctx.store.migrate_job(&self.plan.name, old, &job.name)?;
                if migrated > 0 {
                    info!(deployment = %self.plan.name, from = %old, to = %job.name, migrated, "job renamed");
                }
            }
        }
        task.finished();

        let task = step(PREPARE_STEPS[1]);
        debug!(releases = self.plan.releases.len(), "releases bound");
        task.finished();

        // Binding existing deployment: everything the store knows.
        let task = step(PREPARE_STEPS[2]);
        let existing = self.ctx.store.list_instances(&self.plan.name)?;
        task.finished();

        let task = step(PREPARE_STEPS[3]);
        debug!(pools = self.plan.resource_pools.len(), "resource pools bound");
        task.finished();

        let task = step(PREPARE_STEPS[4]);
        debug!(stemcells = self.plan.stemcells.len(), "stemcells bound");
        task.finished();

        let task = step(PREPARE_STEPS[5]);
        task.finished();

        let task = step(PREPARE_STEPS[6]);
        task.finished();

        // Binding unallocated VMs: idle pool members available for reuse.
        let task = step(PREPARE_STEPS[7]);
        for pool in &self.plan.resource_pools {
            let idle = self.ctx.store.list_idle_vms(&self.plan.name, &pool.name)?;
            debug!(pool = %pool.name, idle = idle.len(), "idle VMs bound");
        }
        task.finished();

        // Binding instance networks: build specs and classify.
        let task = step(PREPARE_STEPS[8]);
        let assembled = self.assemble(existing)?;
        task.finished();

        Ok(assembled)
    }

    fn assemble(&self, existing: Vec<InstanceRecord>) -> DeployResult<Assembled> {
        let mut jobs = Vec::new();
        for job in &self.plan.jobs {
            jobs.push(self.assemble_job(job, &existing)?);
        }

        // Instances whose (job, index) no longer exists in the plan.
        let mut orphans: Vec<InstanceRecord> = existing
            .into_iter()
            .filter(|record| {
                self.plan
                    .job(&record.job)
                    .map_or(true, |job| record.index >= job.instances.len() as u32)
            })
            .collect();
        orphans.sort_by(|a, b| (&a.job, a.index).cmp(&(&b.job, b.index)));

        for record in orphans {
            let plan = delete_plan(record);
            match jobs.iter().position(|j| j.name == plan.job) {
                Some(pos) => jobs[pos].instances.push(plan),
                None => {
                    // Whole job removed from the manifest: a delete-only
                    // entry under the deployment's default update config.
                    let name = plan.job.clone();
                    jobs.push(JobPlan {
                        name,
                        update: self.plan.update,
                        instances: vec![plan],
                    });
                }
            }
        }

        Ok(Assembled { jobs })
    }

    fn assemble_job(&self, job: &Job, existing: &[InstanceRecord]) -> DeployResult<JobPlan> {
        let pool = &self.plan.resource_pools[job.resource_pool];
        let networks = self.networks_value(job);
        let network_digest = spec_digest(&networks);
        let spec = self.plan.instance_spec(job);
        let digest = spec_digest(&spec);

        let mut instances = Vec::with_capacity(job.instances.len());
        for instance in &job.instances {
            let record = existing
                .iter()
                .find(|r| r.job == job.name && r.index == instance.index)
                .cloned();
            let action = self.classify(instance.recreate, instance.target_state, &digest, &network_digest, record.as_ref())?;
            instances.push(InstancePlan {
                job: job.name.clone(),
                index: instance.index,
                action,
                target_state: instance.target_state,
                spec: spec.clone(),
                spec_digest: digest.clone(),
                network_digest: network_digest.clone(),
                pool: pool.name.clone(),
                stemcell: pool.stemcell.clone(),
                cloud_properties: pool.cloud_properties.clone(),
                networks: networks.clone(),
                disk_size_mb: job.persistent_disk_mb,
                existing: record,
            });
        }

        Ok(JobPlan {
            name: job.name.clone(),
            update: job.update,
            instances,
        })
    }

    fn classify(
        &self,
        force_recreate: bool,
        target: TargetState,
        digest: &str,
        network_digest: &str,
        record: Option<&InstanceRecord>,
    ) -> DeployResult<InstanceAction> {
        let Some(record) = record else {
            return Ok(InstanceAction::Create);
        };

        if force_recreate {
            return Ok(InstanceAction::Recreate);
        }

        // A stale stemcell on the backing VM forces replacement.
        if let Some(vm_cid) = &record.vm_cid {
            if let Some(vm) = self.ctx.store.get_vm(vm_cid)? {
                if let Some(job) = self.plan.job(&record.job) {
                    let pool_stemcell = &self.plan.resource_pools[job.resource_pool].stemcell;
                    if *pool_stemcell != vm.stemcell {
                        return Ok(InstanceAction::Recreate);
                    }
                }
            }
        }

        if record.network_digest != network_digest {
            return Ok(InstanceAction::Recreate);
        }

        if record.spec_digest != digest {
            return Ok(InstanceAction::Update);
        }

        if !state_matches(record.state, target) {
            return Ok(InstanceAction::Update);
        }

        Ok(InstanceAction::Noop)
    }

    fn networks_value(&self, job: &Job) -> ManifestValue {
        let entries: Vec<ManifestValue> = job
            .networks
            .iter()
            .map(|jn| {
                let network = &self.plan.networks[jn.network];
                json!({
                    "name": network.name,
                    "static_ips": jn.static_ips,
                    "cloud_properties": network.cloud_properties,
                })
            })
            .collect();
        json!(entries)
    }
}

fn state_matches(state: InstanceLifecycle, target: TargetState) -> bool {
    matches!(
        (state, target),
        (InstanceLifecycle::Started, TargetState::Started)
            | (InstanceLifecycle::Stopped, TargetState::Stopped)
            | (InstanceLifecycle::Detached, TargetState::Detached)
    )
}

fn delete_plan(record: InstanceRecord) -> InstancePlan {
    InstancePlan {
        job: record.job.clone(),
        index: record.index,
        action: InstanceAction::Delete,
        target_state: TargetState::Detached,
        spec: json!({}),
        spec_digest: String::new(),
        network_digest: String::new(),
        pool: String::new(),
        stemcell: StemcellId {
            name: String::new(),
            version: String::new(),
        },
        cloud_properties: json!({}),
        networks: json!([]),
        disk_size_mb: 0,
        existing: Some(record),
    }
}
