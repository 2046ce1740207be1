//! Property binder — merges deployment properties with template schemas.
//!
//! Binding happens per job, over the deployment-level property tree:
//!
//! 1. Property mappings are applied first: each `(alias, source_path)` pair
//!    copies the subtree at `source_path` under `alias` and deletes the
//!    original path.
//! 2. If no selected template declares a property schema, the (mapped) tree
//!    is taken wholesale.
//! 3. If every template declares a schema, the schema union is walked:
//!    manifest values win, template defaults fill absent paths, required
//!    paths without either fail. Keys outside the union are dropped.
//! 4. A mix of declaring and non-declaring templates is an error.

use std::collections::BTreeMap;

use flotilla_manifest::{delete_path, lookup_path, mapping, set_path, ManifestValue};

use crate::error::{PlanError, PlanResult};
use crate::release::{PropertyDef, Template};

/// Bind one job's properties. `mappings` is the job's `property_mappings`
/// block (alias → dotted source path), ordered deterministically.
pub fn bind_job_properties(
    job: &str,
    deployment_properties: &ManifestValue,
    mappings: &BTreeMap<String, String>,
    templates: &[Template],
) -> PlanResult<ManifestValue> {
    let mapped = apply_mappings(job, deployment_properties, mappings)?;
    bind_schemas(job, mapped, templates)
}

fn apply_mappings(
    job: &str,
    properties: &ManifestValue,
    mappings: &BTreeMap<String, String>,
) -> PlanResult<ManifestValue> {
    let mut tree = properties.clone();
    for (alias, source) in mappings {
        let subtree = lookup_path(&tree, source).cloned().ok_or_else(|| {
            PlanError::InvalidPropertyMapping {
                job: job.to_string(),
                alias: alias.clone(),
                source_path: source.clone(),
            }
        })?;
        set_path(&mut tree, alias, subtree);
        delete_path(&mut tree, source);
    }
    Ok(tree)
}

fn bind_schemas(
    job: &str,
    properties: ManifestValue,
    templates: &[Template],
) -> PlanResult<ManifestValue> {
    let declared = templates
        .iter()
        .filter(|t| t.properties.is_some())
        .count();

    if declared == 0 {
        return Ok(properties);
    }
    if declared != templates.len() {
        return Err(PlanError::IncompatibleSpecs {
            job: job.to_string(),
        });
    }

    // Union of all declared schemas; a later template's definition for the
    // same path replaces an earlier one.
    let mut union: BTreeMap<&str, &PropertyDef> = BTreeMap::new();
    for template in templates {
        if let Some(schema) = &template.properties {
            for (path, def) in schema {
                union.insert(path.as_str(), def);
            }
        }
    }

    let mut bound = mapping();
    for (path, def) in union {
        if let Some(value) = lookup_path(&properties, path) {
            set_path(&mut bound, path, value.clone());
        } else if let Some(default) = &def.default {
            set_path(&mut bound, path, default.clone());
        } else if def.required {
            return Err(PlanError::MissingProperty {
                job: job.to_string(),
                path: path.to_string(),
            });
        }
    }
    Ok(bound)
}
