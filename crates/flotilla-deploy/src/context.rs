//! Shared handles threaded through every updater.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use flotilla_cloud::{AgentClient, CloudProvider};
use flotilla_eventlog::{Clock, EventLog};
use flotilla_state::StateStore;

/// Everything a deployment phase needs: the store, the external seams, the
/// event log, the global concurrency cap, and the cancellation signal.
///
/// Cloning is cheap; spawned tasks each take their own copy.
#[derive(Clone)]
pub struct DeployContext {
    pub store: StateStore,
    pub cloud: Arc<dyn CloudProvider>,
    pub agent: Arc<dyn AgentClient>,
    pub clock: Arc<dyn Clock>,
    pub events: EventLog,
    /// Global cap on concurrent instance/VM operations for one apply.
    pub limits: Arc<Semaphore>,
    /// Flipped once to request a graceful halt: no new batches start,
    /// in-flight transitions run to completion.
    pub cancel: watch::Receiver<bool>,
}

impl DeployContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}
