//! Typed field extraction over manifest trees.
//!
//! Each accessor resolves a dotted path and checks the shape, producing
//! `MissingField` / `InvalidType` / `InvalidValue` errors that carry the
//! full path. Optional accessors return `Ok(None)` when the path is absent
//! but still reject present-but-mistyped values.

use serde_json::Value;

use crate::error::{ManifestError, ManifestResult};
use crate::value::{lookup_path, ManifestValue};

/// Resolve a required string field.
pub fn required_str<'a>(root: &'a ManifestValue, path: &str) -> ManifestResult<&'a str> {
    optional_str(root, path)?.ok_or_else(|| ManifestError::missing(path))
}

/// Resolve an optional string field.
pub fn optional_str<'a>(root: &'a ManifestValue, path: &str) -> ManifestResult<Option<&'a str>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ManifestError::invalid_type(path, "string")),
    }
}

/// Resolve a required non-negative integer field.
pub fn required_u32(root: &ManifestValue, path: &str) -> ManifestResult<u32> {
    optional_u32(root, path)?.ok_or_else(|| ManifestError::missing(path))
}

/// Resolve an optional non-negative integer field.
pub fn optional_u32(root: &ManifestValue, path: &str) -> ManifestResult<Option<u32>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            let value = n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    ManifestError::invalid_value(path, "must be a non-negative integer")
                })?;
            Ok(Some(value))
        }
        Some(_) => Err(ManifestError::invalid_type(path, "integer")),
    }
}

/// Resolve an optional 64-bit non-negative integer field.
pub fn optional_u64(root: &ManifestValue, path: &str) -> ManifestResult<Option<u64>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ManifestError::invalid_value(path, "must be a non-negative integer")),
        Some(_) => Err(ManifestError::invalid_type(path, "integer")),
    }
}

/// Resolve an optional boolean field.
pub fn optional_bool(root: &ManifestValue, path: &str) -> ManifestResult<Option<bool>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ManifestError::invalid_type(path, "boolean")),
    }
}

/// Resolve a required sequence field.
pub fn required_sequence<'a>(
    root: &'a ManifestValue,
    path: &str,
) -> ManifestResult<&'a [ManifestValue]> {
    optional_sequence(root, path)?.ok_or_else(|| ManifestError::missing(path))
}

/// Resolve an optional sequence field.
pub fn optional_sequence<'a>(
    root: &'a ManifestValue,
    path: &str,
) -> ManifestResult<Option<&'a [ManifestValue]>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.as_slice())),
        Some(_) => Err(ManifestError::invalid_type(path, "sequence")),
    }
}

/// Resolve a required mapping field.
pub fn required_mapping<'a>(
    root: &'a ManifestValue,
    path: &str,
) -> ManifestResult<&'a ManifestValue> {
    optional_mapping(root, path)?.ok_or_else(|| ManifestError::missing(path))
}

/// Resolve an optional mapping field.
pub fn optional_mapping<'a>(
    root: &'a ManifestValue,
    path: &str,
) -> ManifestResult<Option<&'a ManifestValue>> {
    match lookup_path(root, path) {
        None => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value)),
        Some(_) => Err(ManifestError::invalid_type(path, "mapping")),
    }
}

/// Resolve a required string field constrained to an enumeration.
pub fn enumeration<'a>(
    root: &'a ManifestValue,
    path: &str,
    allowed: &[&str],
) -> ManifestResult<&'a str> {
    let value = required_str(root, path)?;
    if allowed.contains(&value) {
        Ok(value)
    } else {
        Err(ManifestError::invalid_value(
            path,
            format!("must be one of {}", allowed.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> ManifestValue {
        json!({
            "name": "prod",
            "instances": 3,
            "big": 9_000_000_000u64,
            "serial": false,
            "jobs": ["router", "worker"],
            "update": {"canaries": 1},
            "state": "started",
        })
    }

    #[test]
    fn required_str_present_and_missing() {
        let t = tree();
        assert_eq!(required_str(&t, "name").unwrap(), "prod");
        assert_eq!(
            required_str(&t, "label").unwrap_err(),
            ManifestError::missing("label")
        );
    }

    #[test]
    fn required_str_wrong_type() {
        let t = tree();
        assert_eq!(
            required_str(&t, "instances").unwrap_err(),
            ManifestError::invalid_type("instances", "string")
        );
    }

    #[test]
    fn optional_str_absent_is_none() {
        let t = tree();
        assert_eq!(optional_str(&t, "label").unwrap(), None);
        assert_eq!(optional_str(&t, "name").unwrap(), Some("prod"));
    }

    #[test]
    fn integers_check_range() {
        let t = tree();
        assert_eq!(required_u32(&t, "instances").unwrap(), 3);
        assert!(matches!(
            optional_u32(&t, "big").unwrap_err(),
            ManifestError::InvalidValue { .. }
        ));
        assert_eq!(optional_u64(&t, "big").unwrap(), Some(9_000_000_000));
    }

    #[test]
    fn integer_type_mismatch() {
        let t = tree();
        assert_eq!(
            required_u32(&t, "name").unwrap_err(),
            ManifestError::invalid_type("name", "integer")
        );
    }

    #[test]
    fn bool_field() {
        let t = tree();
        assert_eq!(optional_bool(&t, "serial").unwrap(), Some(false));
        assert_eq!(optional_bool(&t, "missing").unwrap(), None);
        assert!(optional_bool(&t, "name").is_err());
    }

    #[test]
    fn sequence_field() {
        let t = tree();
        assert_eq!(required_sequence(&t, "jobs").unwrap().len(), 2);
        assert_eq!(
            required_sequence(&t, "update").unwrap_err(),
            ManifestError::invalid_type("update", "sequence")
        );
    }

    #[test]
    fn mapping_field() {
        let t = tree();
        assert!(required_mapping(&t, "update").is_ok());
        assert_eq!(
            required_mapping(&t, "jobs").unwrap_err(),
            ManifestError::invalid_type("jobs", "mapping")
        );
        assert_eq!(optional_mapping(&t, "missing").unwrap(), None);
    }

    #[test]
    fn enumeration_accepts_and_rejects() {
        let t = tree();
        assert_eq!(
            enumeration(&t, "state", &["started", "stopped"]).unwrap(),
            "started"
        );
        let err = enumeration(&t, "state", &["stopped", "detached"]).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidValue { .. }));
    }

    #[test]
    fn dotted_paths_reach_into_mappings() {
        let t = tree();
        assert_eq!(required_u32(&t, "update.canaries").unwrap(), 1);
    }
}
