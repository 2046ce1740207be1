//! Deployment manifest primitives.
//!
//! A manifest is an arbitrary YAML mapping tree. This crate parses the text
//! into a dynamic value tree, provides dotted-path accessors over it, and a
//! typed field-extraction layer that turns shape mismatches into structured
//! errors naming the offending path.

pub mod error;
pub mod field;
pub mod value;

pub use error::{ManifestError, ManifestResult};
pub use value::{
    delete_path, lookup_path, mapping, merge_into, parse_manifest, set_path, ManifestValue,
};
