//! The top-level apply.
//!
//! Holds the exclusive deployment lock for the whole run, parses the
//! manifest against the published release catalog, prepares, reconciles
//! resource pools, rolls out job updates, and commits the deployment row
//! under shared release locks. Stemcell references are reconciled on every
//! exit path.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use flotilla_cloud::{AgentClient, CloudProvider, LockManager};
use flotilla_eventlog::{Clock, EventLog};
use flotilla_manifest::field;
use flotilla_plan::{DeployOptions, Plan, PlanError, ReleaseCatalog};
use flotilla_state::{DeploymentRecord, ReleaseRef, StateStore};

use crate::context::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::multi::MultiJobUpdater;
use crate::pool::ResourcePoolUpdater;
use crate::prepare::Preparer;

/// Drives one deployment apply end to end.
pub struct Deployer {
    store: StateStore,
    cloud: Arc<dyn CloudProvider>,
    agent: Arc<dyn AgentClient>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    events: EventLog,
    max_threads: usize,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        cloud: Arc<dyn CloudProvider>,
        agent: Arc<dyn AgentClient>,
        clock: Arc<dyn Clock>,
        locks: LockManager,
        events: EventLog,
        max_threads: usize,
    ) -> Self {
        Self {
            store,
            cloud,
            agent,
            clock,
            locks,
            events,
            max_threads,
        }
    }

    /// Apply a manifest. `cancel` requests a graceful halt: no new batches
    /// start, in-flight transitions finish, the run returns `Cancelled`.
    pub async fn deploy(
        &self,
        manifest_text: &str,
        options: &DeployOptions,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<()> {
        // The deployment name gates the lock, so pull it out before full
        // validation.
        let manifest = flotilla_manifest::parse_manifest(manifest_text).map_err(PlanError::from)?;
        let name = field::required_str(&manifest, "name")
            .map_err(PlanError::from)?
            .to_string();

        let _deployment_lock = self.locks.lock_deployment(&name)?;
        info!(deployment = %name, "apply starting");

        let catalog = ReleaseCatalog::new(self.store.list_release_versions()?);
        let plan = Plan::parse(manifest_text, &catalog, options)?;

        let ctx = DeployContext {
            store: self.store.clone(),
            cloud: self.cloud.clone(),
            agent: self.agent.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            limits: Arc::new(Semaphore::new(self.max_threads)),
            cancel,
        };

        let result = self.apply(&plan, &ctx).await;

        // Finalizer: whatever happened above, bring the stemcell join rows
        // back in line with the last committed truth. The deployment lock
        // guard releases on drop, panic included.
        self.reconcile_stemcell_references(&plan.name);

        match &result {
            Ok(()) => info!(deployment = %plan.name, "apply succeeded"),
            Err(error) => warn!(deployment = %plan.name, %error, "apply failed"),
        }
        result
    }

    async fn apply(&self, plan: &Plan, ctx: &DeployContext) -> DeployResult<()> {
        let assembled = Preparer::new(plan, ctx).prepare().await?;

        if ctx.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        ResourcePoolUpdater::new(plan, ctx).update().await?;

        if ctx.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        MultiJobUpdater::new(ctx.clone(), plan.name.clone())
            .run(assembled.jobs)
            .await?;

        if ctx.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        // Commit: shared release locks around the single transaction that
        // rewrites the deployment row and its reference sets.
        let mut release_locks = Vec::with_capacity(plan.releases.len());
        for release in &plan.releases {
            release_locks.push(self.locks.lock_release(&release.name)?);
        }
        let record = DeploymentRecord {
            name: plan.name.clone(),
            manifest: plan.manifest_text.clone(),
            release_versions: plan
                .releases
                .iter()
                .map(|r| ReleaseRef {
                    name: r.name.clone(),
                    version: r.version.clone(),
                })
                .collect(),
            stemcells: plan.stemcells.clone(),
            updated_at: ctx.clock.now_secs(),
        };
        ctx.store.commit_deployment(&record)?;
        drop(release_locks);

        Ok(())
    }

    /// Reconcile join rows to the last committed deployment record; unused
    /// stemcell references disappear. Errors here must not mask the apply
    /// result, so they are only logged.
    fn reconcile_stemcell_references(&self, deployment: &str) {
        let in_use = match self.store.get_deployment(deployment) {
            Ok(Some(record)) => record.stemcells,
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!(%deployment, %error, "skipping stemcell reconciliation");
                return;
            }
        };
        if let Err(error) = self.store.update_stemcell_references(deployment, &in_use) {
            warn!(%deployment, %error, "stemcell reconciliation failed");
        }
    }
}
