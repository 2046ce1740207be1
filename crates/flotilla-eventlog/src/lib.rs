//! Structured event log stream and its terminal renderer.
//!
//! The orchestrator reports progress as line-delimited structured events,
//! one JSON object per line, grouped into stages of numbered tasks. The
//! renderer consumes the stream in arrival order and derives progress bars,
//! in-flight estimates, ETAs, and terminal stage dispositions.
//!
//! # Components
//!
//! - **`clock`** — injectable monotonic clock (system and test variants)
//! - **`event`** — the wire format and its validation
//! - **`stream`** — producer handles over a bounded queue with a lossy
//!   policy for `in_progress` events
//! - **`renderer`** — the consumer-side progress model

pub mod clock;
pub mod event;
pub mod renderer;
pub mod stream;

pub use clock::{Clock, SystemClock, TestClock};
pub use event::{Event, EventError, StageError, TaskState};
pub use renderer::{MemorySink, Renderer, RendererOptions, StageSnapshot};
pub use stream::{EventLog, EventStream, Stage, Task};
