//! Producer side of the event stream.
//!
//! Producers emit through an [`EventLog`] handle into a bounded queue.
//! Emission never blocks: when the queue is full, the oldest pending
//! `in_progress` event is evicted to make room; if none is pending, an
//! incoming `in_progress` event is itself dropped. `started` and terminal
//! events are never dropped — the queue grows past its bound for them,
//! which is fine because their number is bounded by the fleet size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Notify;
use tracing::trace;

use crate::clock::Clock;
use crate::event::{Event, StageError, TaskState};

struct QueueInner {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    producers: AtomicUsize,
    dropped: AtomicU64,
}

fn queue_guard(inner: &QueueInner) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
    match inner.queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Producer handle for the event stream. Cheap to clone; the stream closes
/// when the last producer is dropped.
pub struct EventLog {
    inner: Arc<QueueInner>,
    clock: Arc<dyn Clock>,
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        self.inner.producers.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if self.inner.producers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// Consumer handle: yields events in emission order.
pub struct EventStream {
    inner: Arc<QueueInner>,
}

impl EventLog {
    /// Build a bounded producer/consumer pair.
    pub fn channel(capacity: usize, clock: Arc<dyn Clock>) -> (EventLog, EventStream) {
        let inner = Arc::new(QueueInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            producers: AtomicUsize::new(1),
            dropped: AtomicU64::new(0),
        });
        (
            EventLog {
                inner: inner.clone(),
                clock,
            },
            EventStream { inner },
        )
    }

    /// Open a stage of `total` tasks.
    pub fn begin_stage(&self, name: impl Into<String>, total: u32) -> Stage {
        self.begin_stage_with_tags(name, total, Vec::new())
    }

    /// Open a stage of `total` tasks carrying tags.
    pub fn begin_stage_with_tags(
        &self,
        name: impl Into<String>,
        total: u32,
        tags: Vec<String>,
    ) -> Stage {
        Stage {
            log: self.clone(),
            name: name.into(),
            total,
            tags,
            next_index: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Events dropped by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    fn emit(&self, event: Event) {
        let mut queue = queue_guard(&self.inner);
        if queue.len() >= self.inner.capacity && event.state == TaskState::InProgress {
            let evicted = queue
                .iter()
                .position(|e| e.state == TaskState::InProgress)
                .map(|pos| queue.remove(pos));
            self.inner.dropped.fetch_add(1, Ordering::SeqCst);
            if evicted.is_none() {
                // Nothing evictable; this in_progress event is the casualty.
                trace!(stage = %event.stage, index = event.index, "in_progress event dropped");
                return;
            }
        }
        queue.push_back(event);
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl EventStream {
    /// Wait for the next event. Returns `None` once all producers are gone
    /// and the queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = queue_guard(&self.inner);
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.inner.producers.load(Ordering::SeqCst) == 0 {
                // Re-check: a producer may have pushed between the unlock
                // and the load.
                let mut queue = queue_guard(&self.inner);
                return queue.pop_front();
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drain whatever is queued right now without waiting.
    pub fn try_drain(&mut self) -> Vec<Event> {
        queue_guard(&self.inner).drain(..).collect()
    }
}

/// One named stage; hands out numbered tasks.
pub struct Stage {
    log: EventLog,
    name: String,
    total: u32,
    tags: Vec<String>,
    next_index: Arc<AtomicU64>,
}

impl Stage {
    /// Allocate the next task slot. Emits nothing until
    /// [`Task::started`] is called.
    pub fn task(&self, label: impl Into<String>) -> Task {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) as u32;
        Task {
            log: self.log.clone(),
            stage: self.name.clone(),
            total: self.total,
            tags: self.tags.clone(),
            index,
            label: label.into(),
        }
    }

    /// Allocate a task at an explicit 1-based index (for fan-out where
    /// slots are assigned up front).
    pub fn task_at(&self, index: u32, label: impl Into<String>) -> Task {
        Task {
            log: self.log.clone(),
            stage: self.name.clone(),
            total: self.total,
            tags: self.tags.clone(),
            index,
            label: label.into(),
        }
    }

    /// Emit a stage-level error, terminating the stage.
    pub fn error(&self, code: i64, message: impl Into<String>) {
        let message = message.into();
        self.log.emit(Event {
            time: self.log.clock.now_secs(),
            stage: self.name.clone(),
            task: message.clone(),
            index: 0,
            total: self.total,
            state: TaskState::Failed,
            progress: None,
            tags: tags_field(&self.tags),
            data: None,
            error: Some(StageError { code, message }),
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

/// One numbered task within a stage.
pub struct Task {
    log: EventLog,
    stage: String,
    total: u32,
    tags: Vec<String>,
    index: u32,
    label: String,
}

impl Task {
    pub fn started(&self) {
        self.emit(TaskState::Started, None, None);
    }

    pub fn in_progress(&self, progress: u8) {
        self.emit(TaskState::InProgress, Some(progress.min(100)), None);
    }

    pub fn finished(&self) {
        self.emit(TaskState::Finished, None, None);
    }

    pub fn failed(&self, message: &str) {
        self.emit(
            TaskState::Failed,
            None,
            Some(json!({ "error": message })),
        );
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn emit(&self, state: TaskState, progress: Option<u8>, data: Option<serde_json::Value>) {
        self.log.emit(Event {
            time: self.log.clock.now_secs(),
            stage: self.stage.clone(),
            task: self.label.clone(),
            index: self.index,
            total: self.total,
            state,
            progress,
            tags: tags_field(&self.tags),
            data,
            error: None,
        });
    }
}

fn tags_field(tags: &[String]) -> Option<Vec<String>> {
    if tags.is_empty() {
        None
    } else {
        Some(tags.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn channel(capacity: usize) -> (EventLog, EventStream) {
        EventLog::channel(capacity, TestClock::new(1_000_000))
    }

    #[tokio::test]
    async fn task_events_flow_in_order() {
        let (log, mut stream) = channel(64);
        let stage = log.begin_stage("Updating job web", 2);

        let task = stage.task("web/0 (canary)");
        task.started();
        task.in_progress(50);
        task.finished();
        drop((task, stage, log));

        let a = stream.next().await.unwrap();
        assert_eq!(a.state, TaskState::Started);
        assert_eq!(a.index, 1);
        assert_eq!(a.total, 2);
        assert_eq!(a.task, "web/0 (canary)");
        assert_eq!(a.time, 1_000);

        let b = stream.next().await.unwrap();
        assert_eq!(b.state, TaskState::InProgress);
        assert_eq!(b.progress, Some(50));

        let c = stream.next().await.unwrap();
        assert_eq!(c.state, TaskState::Finished);

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn task_indexes_are_sequential_per_stage() {
        let (log, mut stream) = channel(64);
        let stage = log.begin_stage("Creating bound missing VMs", 3);
        stage.task("vm 1").started();
        stage.task("vm 2").started();
        stage.task("vm 3").started();
        drop((stage, log));

        let mut indexes = Vec::new();
        while let Some(event) = stream.next().await {
            indexes.push(event.index);
        }
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_task_carries_error_data() {
        let (log, mut stream) = channel(64);
        let stage = log.begin_stage("Updating job web", 1);
        let task = stage.task("web/0");
        task.started();
        task.failed("agent unreachable");
        drop((task, stage, log));

        stream.next().await.unwrap();
        let failed = stream.next().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.data.unwrap()["error"], "agent unreachable");
    }

    #[tokio::test]
    async fn stage_error_terminates_with_index_zero() {
        let (log, mut stream) = channel(64);
        let stage = log.begin_stage_with_tags("Preparing deployment", 9, vec!["prod".into()]);
        stage.error(100, "manifest rejected");
        drop((stage, log));

        let event = stream.next().await.unwrap();
        assert_eq!(event.index, 0);
        assert_eq!(event.error.as_ref().unwrap().code, 100);
        assert_eq!(event.tags, Some(vec!["prod".to_string()]));
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_in_progress_only() {
        let (log, mut stream) = channel(2);
        let stage = log.begin_stage("Updating job web", 2);
        let one = stage.task("web/0");
        let two = stage.task("web/1");

        one.started();
        two.started();
        // Queue is at capacity with two undroppable events.
        one.in_progress(10); // evicts nothing, drops itself
        assert_eq!(log.dropped(), 1);

        one.finished(); // terminal: enqueued past the bound
        two.finished();
        drop((one, two, stage, log));

        let states: Vec<TaskState> = {
            let mut out = Vec::new();
            while let Some(e) = stream.next().await {
                out.push(e.state);
            }
            out
        };
        assert_eq!(
            states,
            vec![
                TaskState::Started,
                TaskState::Started,
                TaskState::Finished,
                TaskState::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn overflow_prefers_evicting_older_progress() {
        let (log, mut stream) = channel(2);
        let stage = log.begin_stage("Updating job web", 1);
        let task = stage.task("web/0");

        task.started();
        task.in_progress(10);
        // Full: started + in_progress(10). The next in_progress evicts the
        // older one.
        task.in_progress(90);
        assert_eq!(log.dropped(), 1);
        drop((task, stage, log));

        let mut progress = Vec::new();
        while let Some(e) = stream.next().await {
            if e.state == TaskState::InProgress {
                progress.push(e.progress.unwrap());
            }
        }
        assert_eq!(progress, vec![90]);
    }

    #[tokio::test]
    async fn stream_closes_when_last_producer_drops() {
        let (log, mut stream) = channel(8);
        let clone = log.clone();
        drop(log);

        let stage = clone.begin_stage("Deleting outdated idle VMs", 1);
        stage.task("vm-1").started();
        drop((stage, clone));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
