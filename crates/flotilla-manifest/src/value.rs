//! Dynamic manifest value tree and dotted-path accessors.
//!
//! Manifest values are arbitrary trees over null/bool/number/string/
//! sequence/mapping. We reuse `serde_json::Value` as the tagged union and
//! layer dotted-path operations on top (`deep.x` addresses
//! `{deep: {x: ...}}`).

use serde_json::{Map, Value};

use crate::error::{ManifestError, ManifestResult};

/// A dynamic manifest value tree.
pub type ManifestValue = Value;

/// Parse YAML manifest text into a value tree.
///
/// Mapping keys must be strings; anything else is rejected up front rather
/// than surfacing later as a lookup miss.
pub fn parse_manifest(text: &str) -> ManifestResult<ManifestValue> {
    serde_yaml::from_str(text).map_err(|e| ManifestError::Yaml(e.to_string()))
}

/// Shorthand for an empty mapping value.
pub fn mapping() -> ManifestValue {
    Value::Object(Map::new())
}

/// Look up a dotted path, returning `None` if any segment is absent or a
/// non-mapping intervenes.
pub fn lookup_path<'a>(root: &'a ManifestValue, path: &str) -> Option<&'a ManifestValue> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a value at a dotted path, materializing intermediate mappings.
///
/// A non-mapping intermediate is replaced by a mapping, matching how nested
/// property defaults are grafted onto a flat tree.
pub fn set_path(root: &mut ManifestValue, path: &str, value: ManifestValue) {
    if !root.is_object() {
        *root = mapping();
    }
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        // Intermediates are coerced to mappings above and below, so this
        // always matches.
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        let entry = map
            .entry((*segment).to_string())
            .or_insert_with(mapping);
        if !entry.is_object() {
            *entry = mapping();
        }
        current = entry;
    }
}

/// Remove the value at a dotted path. Returns the removed subtree, or `None`
/// if the path did not resolve. Emptied parent mappings are pruned so a
/// fully-consumed subtree does not linger as `{}`.
pub fn delete_path(root: &mut ManifestValue, path: &str) -> Option<ManifestValue> {
    let segments: Vec<&str> = path.split('.').collect();
    let removed = remove_segments(root, &segments)?;
    Some(removed)
}

fn remove_segments(node: &mut ManifestValue, segments: &[&str]) -> Option<ManifestValue> {
    let map = node.as_object_mut()?;
    if segments.len() == 1 {
        return map.remove(segments[0]);
    }
    let child = map.get_mut(segments[0])?;
    let removed = remove_segments(child, &segments[1..])?;
    if child.as_object().is_some_and(|m| m.is_empty()) {
        map.remove(segments[0]);
    }
    Some(removed)
}

/// Deep-merge `other` into `base`. Mapping values merge recursively;
/// anything else in `other` overwrites.
pub fn merge_into(base: &mut ManifestValue, other: &ManifestValue) {
    match (base, other) {
        (Value::Object(base_map), Value::Object(other_map)) => {
            for (key, value) in other_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, other) => *base = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_manifest() {
        let tree = parse_manifest("name: prod\ninstances: 3\n").unwrap();
        assert_eq!(tree["name"], json!("prod"));
        assert_eq!(tree["instances"], json!(3));
    }

    #[test]
    fn parse_rejects_bad_yaml() {
        let err = parse_manifest("name: [unclosed").unwrap_err();
        assert!(matches!(err, ManifestError::Yaml(_)));
    }

    #[test]
    fn lookup_nested_path() {
        let tree = json!({"deep": {"x": {"y": 7}}});
        assert_eq!(lookup_path(&tree, "deep.x.y"), Some(&json!(7)));
        assert_eq!(lookup_path(&tree, "deep.x"), Some(&json!({"y": 7})));
        assert_eq!(lookup_path(&tree, "deep.missing"), None);
        assert_eq!(lookup_path(&tree, "deep.x.y.z"), None);
    }

    #[test]
    fn set_path_materializes_mappings() {
        let mut tree = mapping();
        set_path(&mut tree, "deep.x", json!("abc"));
        assert_eq!(tree, json!({"deep": {"x": "abc"}}));

        set_path(&mut tree, "deep.y", json!(2));
        assert_eq!(tree, json!({"deep": {"x": "abc", "y": 2}}));
    }

    #[test]
    fn set_path_replaces_scalar_intermediate() {
        let mut tree = json!({"deep": "scalar"});
        set_path(&mut tree, "deep.x", json!(1));
        assert_eq!(tree, json!({"deep": {"x": 1}}));
    }

    #[test]
    fn delete_path_returns_subtree() {
        let mut tree = json!({"a": {"b": {"c": 1}}, "other": 2});
        let removed = delete_path(&mut tree, "a.b").unwrap();
        assert_eq!(removed, json!({"c": 1}));
        // Emptied parent is pruned.
        assert_eq!(tree, json!({"other": 2}));
    }

    #[test]
    fn delete_path_keeps_nonempty_parent() {
        let mut tree = json!({"a": {"b": 1, "keep": 2}});
        delete_path(&mut tree, "a.b").unwrap();
        assert_eq!(tree, json!({"a": {"keep": 2}}));
    }

    #[test]
    fn delete_missing_path_is_none() {
        let mut tree = json!({"a": 1});
        assert!(delete_path(&mut tree, "a.b").is_none());
        assert!(delete_path(&mut tree, "x").is_none());
    }

    #[test]
    fn merge_recurses_into_mappings() {
        let mut base = json!({"a": {"x": 1}, "b": 2});
        merge_into(&mut base, &json!({"a": {"y": 3}, "c": 4}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": 2, "c": 4}));
    }

    #[test]
    fn merge_overwrites_scalars() {
        let mut base = json!({"a": 1});
        merge_into(&mut base, &json!({"a": {"nested": true}}));
        assert_eq!(base, json!({"a": {"nested": true}}));
    }
}
