//! Rollout parameters — canaries, batch width, watch windows, serial flag.

use flotilla_manifest::{field, lookup_path, ManifestError, ManifestResult, ManifestValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `[min, max]` readiness-watch window in milliseconds.
///
/// The updater starts polling the agent at `min` and fails the transition if
/// the instance is not ready by `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl WatchTime {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// How a job's instances are rolled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Number of instances run first as a trial batch.
    pub canaries: u32,
    /// Cap on concurrently-updating instances within a batch.
    pub max_in_flight: u32,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    /// Serial jobs bar other jobs in the deployment from running alongside.
    pub serial: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            canaries: 1,
            max_in_flight: 1,
            canary_watch_time: WatchTime::new(30_000, 90_000),
            update_watch_time: WatchTime::new(30_000, 90_000),
            serial: true,
        }
    }
}

impl UpdateConfig {
    /// Parse an `update` mapping, falling back to `base` for absent fields.
    ///
    /// Deployment-level config parses against the built-in defaults;
    /// job-level config parses against the deployment's.
    pub fn parse(source: Option<&ManifestValue>, base: &UpdateConfig) -> ManifestResult<Self> {
        let Some(source) = source else {
            return Ok(*base);
        };
        Ok(Self {
            canaries: field::optional_u32(source, "canaries")?.unwrap_or(base.canaries),
            max_in_flight: field::optional_u32(source, "max_in_flight")?
                .unwrap_or(base.max_in_flight),
            canary_watch_time: parse_watch_time(source, "canary_watch_time")?
                .unwrap_or(base.canary_watch_time),
            update_watch_time: parse_watch_time(source, "update_watch_time")?
                .unwrap_or(base.update_watch_time),
            serial: field::optional_bool(source, "serial")?.unwrap_or(base.serial),
        })
    }
}

/// Parse a watch time: either an integer (a point window `N..N`) or a
/// `"min-max"` millisecond range string.
fn parse_watch_time(source: &ManifestValue, path: &str) -> ManifestResult<Option<WatchTime>> {
    match lookup_path(source, path) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            let ms = n
                .as_u64()
                .ok_or_else(|| ManifestError::invalid_value(path, "must be non-negative"))?;
            Ok(Some(WatchTime::new(ms, ms)))
        }
        Some(Value::String(s)) => {
            let (min, max) = s
                .split_once('-')
                .ok_or_else(|| ManifestError::invalid_value(path, "expected \"min-max\" range"))?;
            let min_ms: u64 = min.trim().parse().map_err(|_| {
                ManifestError::invalid_value(path, "range bounds must be integers")
            })?;
            let max_ms: u64 = max.trim().parse().map_err(|_| {
                ManifestError::invalid_value(path, "range bounds must be integers")
            })?;
            if min_ms > max_ms {
                return Err(ManifestError::invalid_value(path, "min exceeds max"));
            }
            Ok(Some(WatchTime::new(min_ms, max_ms)))
        }
        Some(_) => Err(ManifestError::invalid_type(path, "integer or range string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let cfg = UpdateConfig::default();
        assert_eq!(cfg.canaries, 1);
        assert_eq!(cfg.max_in_flight, 1);
        assert!(cfg.serial);
    }

    #[test]
    fn absent_source_inherits_base() {
        let base = UpdateConfig {
            canaries: 3,
            ..UpdateConfig::default()
        };
        let cfg = UpdateConfig::parse(None, &base).unwrap();
        assert_eq!(cfg, base);
    }

    #[test]
    fn parse_full_block() {
        let source = json!({
            "canaries": 2,
            "max_in_flight": 4,
            "canary_watch_time": "1000-30000",
            "update_watch_time": 5000,
            "serial": false,
        });
        let cfg = UpdateConfig::parse(Some(&source), &UpdateConfig::default()).unwrap();
        assert_eq!(cfg.canaries, 2);
        assert_eq!(cfg.max_in_flight, 4);
        assert_eq!(cfg.canary_watch_time, WatchTime::new(1000, 30_000));
        assert_eq!(cfg.update_watch_time, WatchTime::new(5000, 5000));
        assert!(!cfg.serial);
    }

    #[test]
    fn job_level_overrides_only_named_fields() {
        let base = UpdateConfig {
            canaries: 2,
            max_in_flight: 8,
            ..UpdateConfig::default()
        };
        let source = json!({"max_in_flight": 3});
        let cfg = UpdateConfig::parse(Some(&source), &base).unwrap();
        assert_eq!(cfg.canaries, 2);
        assert_eq!(cfg.max_in_flight, 3);
    }

    #[test]
    fn watch_time_range_with_spaces() {
        let source = json!({"canary_watch_time": "1000 - 2000"});
        let cfg = UpdateConfig::parse(Some(&source), &UpdateConfig::default()).unwrap();
        assert_eq!(cfg.canary_watch_time, WatchTime::new(1000, 2000));
    }

    #[test]
    fn watch_time_rejects_inverted_range() {
        let source = json!({"canary_watch_time": "5000-1000"});
        let err = UpdateConfig::parse(Some(&source), &UpdateConfig::default()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidValue { .. }));
    }

    #[test]
    fn watch_time_rejects_garbage() {
        let source = json!({"update_watch_time": "soon"});
        assert!(UpdateConfig::parse(Some(&source), &UpdateConfig::default()).is_err());
        let source = json!({"update_watch_time": [1, 2]});
        assert!(UpdateConfig::parse(Some(&source), &UpdateConfig::default()).is_err());
    }
}
