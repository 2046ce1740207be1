//! The canary-then-batch job updater.
//!
//! Per job the updater moves `IDLE → CANARIES → BATCHES → DONE`, halting on
//! the first failure. Canaries complete before any non-canary starts;
//! batches of `max_in_flight` run sequentially with unordered concurrency
//! inside each batch; a failing batch drains its in-flight siblings before
//! halting.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use flotilla_eventlog::Stage;

use crate::context::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::instance::InstanceUpdater;
use crate::prepare::{InstancePlan, JobPlan};

/// Where the updater's state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobUpdaterState {
    Idle,
    Canaries,
    Batches,
    Done,
    Halted,
}

/// Rolls out one job's instance transitions.
pub struct JobUpdater {
    ctx: DeployContext,
    deployment: String,
    plan: JobPlan,
}

impl JobUpdater {
    pub fn new(ctx: DeployContext, deployment: String, plan: JobPlan) -> Self {
        Self {
            ctx,
            deployment,
            plan,
        }
    }

    /// Run the rollout to completion or halt. Returns the terminal state;
    /// a halt also carries the cause in the error.
    pub async fn run(&self) -> DeployResult<JobUpdaterState> {
        let changed = self.plan.changed();
        if changed.is_empty() {
            debug!(job = %self.plan.name, "nothing to update");
            return Ok(JobUpdaterState::Done);
        }

        let total = changed.len() as u32;
        let stage = self
            .ctx
            .events
            .begin_stage(format!("Updating job {}", self.plan.name), total);

        let mut state = JobUpdaterState::Idle;
        debug!(job = %self.plan.name, ?state, total, "job updater starting");

        if self.ctx.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let canary_count = (self.plan.update.canaries as usize).min(changed.len());
        let (canaries, rest) = changed.split_at(canary_count);

        state = JobUpdaterState::Canaries;
        debug!(job = %self.plan.name, ?state, count = canary_count, "running canaries");
        let canary_concurrency = self
            .plan
            .update
            .canaries
            .min(self.plan.update.max_in_flight)
            .max(1) as usize;
        if let Err(error) = self
            .run_batch(&stage, canaries, 0, canary_concurrency, true)
            .await
        {
            state = JobUpdaterState::Halted;
            warn!(job = %self.plan.name, ?state, %error, "canary failed");
            return Err(halt(&self.plan.name, error));
        }

        state = JobUpdaterState::Batches;
        debug!(job = %self.plan.name, ?state, remaining = rest.len(), "canaries passed");
        let max_in_flight = self.plan.update.max_in_flight.max(1) as usize;
        let mut offset = canary_count;
        for batch in rest.chunks(max_in_flight) {
            // Graceful cancellation: no new batch starts.
            if self.ctx.is_cancelled() {
                state = JobUpdaterState::Halted;
                debug!(job = %self.plan.name, ?state, "cancelled between batches");
                return Err(DeployError::Cancelled);
            }
            if let Err(error) = self
                .run_batch(&stage, batch, offset, max_in_flight, false)
                .await
            {
                state = JobUpdaterState::Halted;
                warn!(job = %self.plan.name, ?state, %error, "batch failed");
                return Err(halt(&self.plan.name, error));
            }
            offset += batch.len();
        }

        state = JobUpdaterState::Done;
        info!(job = %self.plan.name, ?state, updated = total, "job updated");
        Ok(state)
    }

    /// Run one set of instances with bounded concurrency. Waits for every
    /// in-flight sibling even after a failure, then reports the first
    /// error.
    async fn run_batch(
        &self,
        stage: &Stage,
        items: &[InstancePlan],
        offset: usize,
        concurrency: usize,
        canary: bool,
    ) -> DeployResult<()> {
        let batch_limit = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();

        for (i, item) in items.iter().enumerate() {
            let label = if canary {
                format!("{}/{} (canary)", item.job, item.index)
            } else {
                format!("{}/{}", item.job, item.index)
            };
            let task = stage.task_at((offset + i + 1) as u32, label);
            let item = item.clone();
            let ctx = self.ctx.clone();
            let deployment = self.deployment.clone();
            let batch_limit = batch_limit.clone();
            let watch = if canary {
                self.plan.update.canary_watch_time
            } else {
                self.plan.update.update_watch_time
            };

            tasks.spawn(async move {
                let _batch_permit = batch_limit
                    .acquire_owned()
                    .await
                    .map_err(|_| DeployError::InvariantViolated("batch limit closed".into()))?;
                let _global_permit = ctx
                    .limits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DeployError::InvariantViolated("global limit closed".into()))?;

                task.started();
                let updater = InstanceUpdater::new(ctx, deployment);
                match updater.run(&item, watch).await {
                    Ok(()) => {
                        task.finished();
                        Ok(())
                    }
                    Err(error) => {
                        task.failed(&error.to_string());
                        Err(error)
                    }
                }
            });
        }

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
                            "instance task panicked: {join_error}"
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
}

fn halt(job: &str, error: DeployError) -> DeployError {
    match error {
        DeployError::Cancelled => DeployError::Cancelled,
        other => DeployError::Halted {
            job: job.to_string(),
            reason: other.to_string(),
        },
    }
}
