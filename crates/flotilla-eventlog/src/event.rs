//! The event wire format: one JSON object per line.
//!
//! Contract: the first event per `(stage, index)` is `started`; `total` is
//! authoritative from the first event of the stage and never changes; a
//! task is terminal after `finished` or `failed`; a stage is terminal when
//! all `total` tasks are terminal or a stage-level `error` event arrives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias for event parsing.
pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    #[error("invalid event line: {0}")]
    Invalid(String),
}

/// Task lifecycle state carried on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Started,
    InProgress,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

/// Stage-level error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub code: i64,
    pub message: String,
}

/// One line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since epoch.
    pub time: u64,
    pub stage: String,
    /// Human-readable task label.
    pub task: String,
    /// 1-based task number within the stage (0 on stage-level errors).
    pub index: u32,
    /// Task count of the stage.
    pub total: u32,
    pub state: TaskState,
    /// Percentage 0..=100; only meaningful on `in_progress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Free-form payload; carries `error` on failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Stage-level error; terminates the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl Event {
    /// Encode as a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse and validate one line.
    pub fn parse_line(line: &str) -> EventResult<Event> {
        let event: Event =
            serde_json::from_str(line).map_err(|e| EventError::Invalid(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> EventResult<()> {
        if self.error.is_none() {
            if self.index == 0 {
                return Err(EventError::Invalid("index must be 1-based".to_string()));
            }
            if self.total < self.index {
                return Err(EventError::Invalid(format!(
                    "total {} is below index {}",
                    self.total, self.index
                )));
            }
        }
        if let Some(progress) = self.progress {
            if progress > 100 {
                return Err(EventError::Invalid(format!(
                    "progress {progress} is out of range"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event {
            time: 1000,
            stage: "Updating job web".to_string(),
            task: "web/0 (canary)".to_string(),
            index: 1,
            total: 3,
            state: TaskState::Started,
            progress: None,
            tags: None,
            data: None,
            error: None,
        }
    }

    #[test]
    fn line_roundtrip() {
        let original = event();
        let line = original.to_line();
        assert!(!line.contains('\n'));
        let parsed = Event::parse_line(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn optional_fields_are_omitted_from_the_wire() {
        let line = event().to_line();
        assert!(!line.contains("progress"));
        assert!(!line.contains("tags"));
        assert!(!line.contains("data"));
        assert!(!line.contains("\"error\""));
    }

    #[test]
    fn parses_known_good_line() {
        let line = r#"{"time":1700000000,"stage":"Preparing deployment","task":"Binding releases","index":2,"total":9,"state":"finished"}"#;
        let event = Event::parse_line(line).unwrap();
        assert_eq!(event.index, 2);
        assert_eq!(event.total, 9);
        assert_eq!(event.state, TaskState::Finished);
        assert!(event.state.is_terminal());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Event::parse_line("not json").is_err());
        assert!(Event::parse_line("{\"time\":1}").is_err());
    }

    #[test]
    fn rejects_zero_index_without_stage_error() {
        let mut e = event();
        e.index = 0;
        assert!(Event::parse_line(&e.to_line()).is_err());
    }

    #[test]
    fn stage_error_event_may_use_index_zero() {
        let mut e = event();
        e.index = 0;
        e.state = TaskState::Failed;
        e.error = Some(StageError {
            code: 100,
            message: "boom".to_string(),
        });
        let parsed = Event::parse_line(&e.to_line()).unwrap();
        assert_eq!(parsed.error.unwrap().message, "boom");
    }

    #[test]
    fn rejects_total_below_index() {
        let mut e = event();
        e.index = 5;
        e.total = 3;
        assert!(Event::parse_line(&e.to_line()).is_err());
    }

    #[test]
    fn rejects_out_of_range_progress() {
        let mut e = event();
        e.state = TaskState::InProgress;
        e.progress = Some(150);
        assert!(Event::parse_line(&e.to_line()).is_err());
    }

    #[test]
    fn failed_event_carries_error_in_data() {
        let mut e = event();
        e.state = TaskState::Failed;
        e.data = Some(json!({"error": "agent unreachable"}));
        let parsed = Event::parse_line(&e.to_line()).unwrap();
        assert_eq!(parsed.data.unwrap()["error"], json!("agent unreachable"));
    }
}
