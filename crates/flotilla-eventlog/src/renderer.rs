//! Consumer-side progress model.
//!
//! The renderer reads events in arrival order and keeps a model for the
//! stage the cursor is on. The cursor only moves forward: the first event
//! of a never-seen stage finalizes the current one, and late events for
//! earlier stages are suppressed. All mutation happens under one mutex.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use colored::Colorize;
use tracing::trace;

use crate::clock::Clock;
use crate::event::{Event, StageError, TaskState};

/// Renderer knobs.
#[derive(Debug, Clone, Default)]
pub struct RendererOptions {
    /// Stages that print one line per task instead of a progress bar.
    pub no_progress_bar_stages: HashSet<String>,
}

/// Read-only view of the current stage, for tests and status endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub name: String,
    pub tags: Vec<String>,
    pub total: u32,
    pub finished_steps: u32,
    /// Fractional progress: terminal tasks count 1.0, running tasks their
    /// reported fraction. Clipped to `[0, total]`.
    pub current: f64,
    /// Largest number of simultaneously-started tasks observed.
    pub max_in_flight: u32,
    /// Absolute clock time the stage is estimated to finish at.
    pub eta_ms: Option<u64>,
    pub terminal: bool,
    pub failed: bool,
}

#[derive(Debug)]
struct TaskModel {
    label: String,
    state: TaskState,
    progress: u8,
    started_ms: u64,
    canary: bool,
}

#[derive(Debug)]
struct StageModel {
    name: String,
    tags: Vec<String>,
    total: u32,
    tasks: HashMap<u32, TaskModel>,
    finished_steps: u32,
    failed_tasks: u32,
    stage_error: Option<StageError>,
    first_event_ms: u64,
    last_event_ms: u64,
    running: u32,
    max_in_flight: u32,
    non_canary_start_ms: Option<u64>,
    durations_ms: Vec<u64>,
    end_printed: bool,
}

impl StageModel {
    fn new(name: String, tags: Vec<String>, total: u32, now_ms: u64) -> Self {
        Self {
            name,
            tags,
            total,
            tasks: HashMap::new(),
            finished_steps: 0,
            failed_tasks: 0,
            stage_error: None,
            first_event_ms: now_ms,
            last_event_ms: now_ms,
            running: 0,
            max_in_flight: 0,
            non_canary_start_ms: None,
            durations_ms: Vec::new(),
            end_printed: false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.stage_error.is_some() || (self.total > 0 && self.finished_steps >= self.total)
    }

    fn current_progress(&self) -> f64 {
        let sum: f64 = self
            .tasks
            .values()
            .map(|t| {
                if t.state.is_terminal() {
                    1.0
                } else {
                    f64::from(t.progress) / 100.0
                }
            })
            .sum();
        sum.clamp(0.0, f64::from(self.total))
    }

    /// `ETA = non_canary_start + avg_duration × ceil(remaining / B)` where
    /// `B` is the observed max in-flight and the average runs over
    /// completed non-canary tasks.
    fn eta_ms(&self) -> Option<u64> {
        let start = self.non_canary_start_ms?;
        if self.durations_ms.is_empty() || self.max_in_flight == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.finished_steps);
        if remaining == 0 {
            return None;
        }
        let avg = self.durations_ms.iter().sum::<u64>() / self.durations_ms.len() as u64;
        let batches_remaining = u64::from(remaining.div_ceil(self.max_in_flight));
        Some(start + avg * batches_remaining)
    }

    fn header(&self) -> String {
        if self.tags.is_empty() {
            self.name.clone()
        } else {
            let mut tags = self.tags.clone();
            tags.sort();
            format!("{} {}", self.name, tags.join(", ").green())
        }
    }

    fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            name: self.name.clone(),
            tags: self.tags.clone(),
            total: self.total,
            finished_steps: self.finished_steps,
            current: self.current_progress(),
            max_in_flight: self.max_in_flight,
            eta_ms: self.eta_ms(),
            terminal: self.is_terminal(),
            failed: self.failed_tasks > 0 || self.stage_error.is_some(),
        }
    }
}

struct Inner<W> {
    out: W,
    current: Option<StageModel>,
    seen_stages: HashSet<String>,
    invalid_lines: u64,
    ignored_events: u64,
}

/// The terminal renderer. A single mutex serializes every mutation of the
/// progress model and the output buffer.
pub struct Renderer<W: Write + Send> {
    inner: Mutex<Inner<W>>,
    clock: Arc<dyn Clock>,
    options: RendererOptions,
}

impl<W: Write + Send> Renderer<W> {
    pub fn new(out: W, clock: Arc<dyn Clock>, options: RendererOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                out,
                current: None,
                seen_stages: HashSet::new(),
                invalid_lines: 0,
                ignored_events: 0,
            }),
            clock,
            options,
        }
    }

    /// Feed one raw line. Invalid lines are counted and dropped.
    pub fn handle_line(&self, line: &str) {
        match Event::parse_line(line) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                trace!(error = %e, "dropping invalid event line");
                self.lock().invalid_lines += 1;
            }
        }
    }

    /// Feed one parsed event.
    pub fn handle_event(&self, event: Event) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let on_current = inner
            .current
            .as_ref()
            .is_some_and(|s| s.name == event.stage);
        if !on_current {
            if inner.seen_stages.contains(&event.stage) {
                // Single cursor: earlier stages are never reopened.
                inner.ignored_events += 1;
                return;
            }
            self.open_stage(&mut inner, &event, now);
        }

        self.apply_event(&mut inner, event, now);
    }

    /// Finalize the current stage (flush its end label).
    pub fn finish(&self) {
        let mut inner = self.lock();
        if let Some(mut stage) = inner.current.take() {
            print_stage_end(&mut inner.out, &mut stage, &self.options);
            inner.current = Some(stage);
        }
    }

    /// Snapshot of the stage the cursor is on.
    pub fn snapshot(&self) -> Option<StageSnapshot> {
        self.lock().current.as_ref().map(StageModel::snapshot)
    }

    pub fn invalid_lines(&self) -> u64 {
        self.lock().invalid_lines
    }

    pub fn ignored_events(&self) -> u64 {
        self.lock().ignored_events
    }

    fn lock(&self) -> MutexGuard<'_, Inner<W>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open_stage(&self, inner: &mut Inner<W>, event: &Event, now: u64) {
        if let Some(mut previous) = inner.current.take() {
            print_stage_end(&mut inner.out, &mut previous, &self.options);
        }

        let tags = event.tags.clone().unwrap_or_default();
        let stage = StageModel::new(event.stage.clone(), tags, event.total, now);
        inner.seen_stages.insert(event.stage.clone());

        if !self.options.no_progress_bar_stages.contains(&stage.name) {
            let _ = writeln!(inner.out, "{}", stage.header());
        }
        inner.current = Some(stage);
    }

    fn apply_event(&self, inner: &mut Inner<W>, event: Event, now: u64) {
        let no_bar = self.options.no_progress_bar_stages.contains(&event.stage);
        let Some(stage) = inner.current.as_mut() else {
            return;
        };
        stage.last_event_ms = now;

        if let Some(error) = event.error {
            stage.stage_error = Some(error);
            if !stage.end_printed {
                let _ = writeln!(
                    inner.out,
                    "{} {} ({})",
                    "Error".red(),
                    stage.header(),
                    format_elapsed(stage.last_event_ms - stage.first_event_ms),
                );
                stage.end_printed = true;
            }
            return;
        }

        match event.state {
            TaskState::Started => {
                if stage.tasks.contains_key(&event.index) {
                    // Contract violation (duplicate started); keep the first.
                    inner.ignored_events += 1;
                    return;
                }
                let canary = event.task.contains("(canary)");
                stage.tasks.insert(
                    event.index,
                    TaskModel {
                        label: event.task.clone(),
                        state: TaskState::Started,
                        progress: 0,
                        started_ms: now,
                        canary,
                    },
                );
                stage.running += 1;
                stage.max_in_flight = stage.max_in_flight.max(stage.running);
                if !canary && stage.non_canary_start_ms.is_none() {
                    stage.non_canary_start_ms = Some(now);
                }
                if no_bar {
                    let line = format!(
                        "  Started {}: {}",
                        stage.header(),
                        display_label(&event.task)
                    );
                    let _ = writeln!(inner.out, "{line}");
                }
            }

            TaskState::InProgress => match stage.tasks.get_mut(&event.index) {
                Some(task) if !task.state.is_terminal() => {
                    task.state = TaskState::InProgress;
                    task.progress = event.progress.unwrap_or(task.progress).min(100);
                }
                // Progress for unknown or finished tasks is ignored.
                _ => inner.ignored_events += 1,
            },

            TaskState::Finished | TaskState::Failed => {
                let stage_header = stage.header();
                match stage.tasks.get_mut(&event.index) {
                    None => {
                        // Terminal event for a task never started: ignored.
                        inner.ignored_events += 1;
                    }
                    Some(task) if task.state.is_terminal() => {
                        // At most one terminal event per task counts.
                        inner.ignored_events += 1;
                    }
                    Some(task) => {
                        task.state = event.state;
                        stage.finished_steps += 1;
                        stage.running = stage.running.saturating_sub(1);
                        if event.state == TaskState::Failed {
                            stage.failed_tasks += 1;
                        }
                        if !task.canary {
                            stage.durations_ms.push(now.saturating_sub(task.started_ms));
                        }
                        if no_bar {
                            let verb = if event.state == TaskState::Finished {
                                "     Done"
                            } else {
                                "   Failed"
                            };
                            let line = format!(
                                "{verb} {}: {}",
                                stage_header,
                                display_label(&task.label)
                            );
                            let _ = writeln!(inner.out, "{line}");
                        }
                    }
                }

                if stage.is_terminal() && !no_bar && !stage.end_printed {
                    print_stage_end_inner(&mut inner.out, stage);
                }
            }
        }
    }
}

fn print_stage_end<W: Write>(out: &mut W, stage: &mut StageModel, options: &RendererOptions) {
    if stage.end_printed || options.no_progress_bar_stages.contains(&stage.name) {
        return;
    }
    print_stage_end_inner(out, stage);
}

fn print_stage_end_inner<W: Write>(out: &mut W, stage: &mut StageModel) {
    let elapsed = format_elapsed(stage.last_event_ms.saturating_sub(stage.first_event_ms));
    let title = if stage.failed_tasks > 0 || stage.stage_error.is_some() {
        "Error".red().to_string()
    } else if stage.is_terminal() {
        "Done".green().to_string()
    } else {
        "Not done".yellow().to_string()
    };
    let _ = writeln!(out, "{title} {} ({elapsed})", stage.header());
    stage.end_printed = true;
}

/// `HH:MM:SS` wall-time label.
fn format_elapsed(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Labels beginning with two uppercase letters print verbatim; everything
/// else gets its first character lowercased.
fn display_label(label: &str) -> String {
    let mut iter = label.chars();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let second_upper = iter.clone().next().is_some_and(|c| c.is_uppercase());
    if first.is_uppercase() && second_upper {
        label.to_string()
    } else {
        first.to_lowercase().chain(iter).collect()
    }
}

/// Shared in-memory writer for tests.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let buffer = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
