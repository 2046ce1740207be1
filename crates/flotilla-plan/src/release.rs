//! Release catalog — versioned releases and the templates they declare.
//!
//! A release version is immutable once published. The catalog is the
//! orchestrator's view of the published release versions (loaded from the
//! store by the caller); the plan resolves manifest-declared releases
//! against it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use flotilla_manifest::ManifestValue;

/// Declared property of a template: optional default, optional required flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ManifestValue>,
    #[serde(default)]
    pub required: bool,
}

/// A named unit of software contributed by a release version.
///
/// `properties` is the declared property schema mapping dotted paths to
/// definitions. A template either declares a schema or carries none at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PropertyDef>>,
}

/// An immutable published release version with its templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl ReleaseVersion {
    /// Composite `name/version` key used by the store and the catalog.
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    pub fn find_template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }
}

/// The set of published release versions visible to one apply.
#[derive(Debug, Clone, Default)]
pub struct ReleaseCatalog {
    versions: Vec<ReleaseVersion>,
}

impl ReleaseCatalog {
    pub fn new(versions: Vec<ReleaseVersion>) -> Self {
        Self { versions }
    }

    pub fn find(&self, name: &str, version: &str) -> Option<&ReleaseVersion> {
        self.versions
            .iter()
            .find(|v| v.name == name && v.version == version)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
