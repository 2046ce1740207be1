//! Batch multi-job scheduling.
//!
//! Jobs execute in manifest order, partitioned into runs delimited by
//! serial jobs: a serial job runs alone; consecutive parallel jobs share a
//! run and interleave freely. Runs execute strictly one after another. On a
//! job failure, in-flight jobs in the same run finish reaching a quiescent
//! state, later runs never start, and the first error propagates.

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::context::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::job::JobUpdater;
use crate::prepare::JobPlan;

/// Executes many job updaters under the deployment's concurrency cap.
pub struct MultiJobUpdater {
    ctx: DeployContext,
    deployment: String,
}

impl MultiJobUpdater {
    pub fn new(ctx: DeployContext, deployment: String) -> Self {
        Self { ctx, deployment }
    }

    pub async fn run(&self, jobs: Vec<JobPlan>) -> DeployResult<()> {
        let runs = partition_runs(jobs);
        let total_runs = runs.len();

        for (i, run) in runs.into_iter().enumerate() {
            if self.ctx.is_cancelled() {
                return Err(DeployError::Cancelled);
            }

            let names: Vec<&str> = run.iter().map(|j| j.name.as_str()).collect();
            debug!(run = i + 1, total_runs, jobs = ?names, "starting update run");

            let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();
            for job in run {
                let updater = JobUpdater::new(self.ctx.clone(), self.deployment.clone(), job);
                tasks.spawn(async move { updater.run().await.map(|_| ()) });
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
                                "job task panicked: {join_error}"
                            )));
                        }
                    }
                }
            }
            if let Some(error) = first_error {
                // Later runs are cancelled implicitly by returning here.
                return Err(error);
            }
        }

        info!(deployment = %self.deployment, "all job updates finished");
        Ok(())
    }
}

/// Split jobs into sequential runs: serial jobs are barriers.
fn partition_runs(jobs: Vec<JobPlan>) -> Vec<Vec<JobPlan>> {
    let mut runs = Vec::new();
    let mut parallel: Vec<JobPlan> = Vec::new();

    for job in jobs {
        if job.update.serial {
            if !parallel.is_empty() {
                runs.push(std::mem::take(&mut parallel));
            }
            runs.push(vec![job]);
        } else {
            parallel.push(job);
        }
    }
    if !parallel.is_empty() {
        runs.push(parallel);
    }
    runs
}
