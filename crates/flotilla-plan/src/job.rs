//! Job groups — parsing and the per-instance target model.
//!
//! A job is parsed field by field in a fixed order, because later fields
//! depend on earlier ones (templates must be resolved before properties can
//! be bound; the update config must exist before instances are laid out):
//!
//! `parse_name → parse_release → parse_template → parse_templates →
//! parse_disk → parse_properties → parse_resource_pool →
//! parse_update_config → parse_instances → parse_networks`

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use flotilla_manifest::{field, lookup_path, ManifestError, ManifestValue};

use crate::error::{PlanError, PlanResult};
use crate::plan::{DeployOptions, Network, ResourcePool};
use crate::properties::bind_job_properties;
use crate::release::{ReleaseVersion, Template};
use crate::update_config::UpdateConfig;
use crate::{NetworkKey, PoolKey, ReleaseKey};

/// Desired end state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Started,
    Stopped,
    Detached,
}

/// Per-index override supplied on the command line or by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideState {
    Started,
    Stopped,
    Detached,
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStateOverride {
    pub job: String,
    pub index: u32,
    pub state: OverrideState,
}

/// A `(job, index)` slot that may be backed by a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub index: u32,
    pub target_state: TargetState,
    /// Force VM replacement regardless of spec digest.
    pub recreate: bool,
}

/// A job's attachment to one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNetwork {
    pub network: NetworkKey,
    pub static_ips: Vec<String>,
}

/// A named group of instances running the same template stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: String,
    pub release: ReleaseKey,
    /// Resolved templates, manifest order, names unique.
    pub templates: Vec<Template>,
    pub persistent_disk_mb: u64,
    /// Bound property tree (see [`crate::properties`]).
    pub properties: ManifestValue,
    pub resource_pool: PoolKey,
    pub update: UpdateConfig,
    pub instances: Vec<Instance>,
    pub networks: Vec<JobNetwork>,
    /// Previous job name to migrate store records from.
    pub rename_from: Option<String>,
}

/// Everything a job parse needs from the surrounding plan.
pub(crate) struct JobContext<'a> {
    pub releases: &'a [ReleaseVersion],
    pub pools: &'a [ResourcePool],
    pub networks: &'a [Network],
    pub deployment_properties: &'a ManifestValue,
    pub default_update: &'a UpdateConfig,
    pub options: &'a DeployOptions,
}

/// Parse one entry of the manifest's `jobs` sequence. `position` is the
/// entry's index, used to name paths in shape errors.
pub(crate) fn parse_job(
    source: &ManifestValue,
    position: usize,
    ctx: &JobContext<'_>,
) -> PlanResult<Job> {
    let prefix = format!("jobs[{position}]");

    let name = parse_name(source, &prefix)?;
    let job_release = parse_release(source, &prefix, ctx)?;
    let singular_refs = parse_template(source, &prefix, &name)?;
    let (release, templates) =
        parse_templates(source, &prefix, &name, job_release, singular_refs, ctx)?;
    let persistent_disk_mb = parse_disk(source, &prefix)?;
    let properties = parse_properties(source, &prefix, &name, &templates, ctx)?;
    let resource_pool = parse_resource_pool(source, &prefix, &name, ctx)?;
    let update = parse_update_config(source, &prefix, ctx)?;
    let instances = parse_instances(source, &prefix, &name, ctx)?;
    let networks = parse_networks(source, &prefix, &name, ctx)?;
    let rename_from = scoped(field::optional_str(source, "rename_from"), &prefix)?
        .map(str::to_string);

    Ok(Job {
        name,
        release,
        templates,
        persistent_disk_mb,
        properties,
        resource_pool,
        update,
        instances,
        networks,
        rename_from,
    })
}

/// Prefix shape-error paths with the job's position in the manifest.
fn scoped<T>(result: Result<T, ManifestError>, prefix: &str) -> Result<T, ManifestError> {
    result.map_err(|e| match e {
        ManifestError::MissingField { path } => ManifestError::MissingField {
            path: format!("{prefix}.{path}"),
        },
        ManifestError::InvalidType { path, expected } => ManifestError::InvalidType {
            path: format!("{prefix}.{path}"),
            expected,
        },
        ManifestError::InvalidValue { path, reason } => ManifestError::InvalidValue {
            path: format!("{prefix}.{path}"),
            reason,
        },
        other => other,
    })
}

fn parse_name(source: &ManifestValue, prefix: &str) -> PlanResult<String> {
    Ok(scoped(field::required_str(source, "name"), prefix)?.to_string())
}

/// Resolve the job-level `release` key, or the deployment's sole release
/// when the key is absent and the choice is unambiguous.
fn parse_release(
    source: &ManifestValue,
    prefix: &str,
    ctx: &JobContext<'_>,
) -> PlanResult<Option<ReleaseKey>> {
    match scoped(field::optional_str(source, "release"), prefix)? {
        Some(release) => {
            let key = find_release(ctx, release)
                .ok_or_else(|| PlanError::UnknownRelease {
                    release: release.to_string(),
                })?;
            Ok(Some(key))
        }
        None if ctx.releases.len() == 1 => Ok(Some(0)),
        None => Ok(None),
    }
}

fn find_release(ctx: &JobContext<'_>, name: &str) -> Option<ReleaseKey> {
    ctx.releases.iter().position(|r| r.name == name)
}

/// An unresolved template reference: a name plus an optional release
/// override from a plural `templates` entry.
struct TemplateRef {
    name: String,
    release: Option<String>,
}

/// Parse the singular `template` key: a string yields one template, a
/// sequence yields templates in that order. All use the job's release.
fn parse_template(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
) -> PlanResult<Vec<TemplateRef>> {
    match lookup_path(source, "template") {
        None => Ok(Vec::new()),
        Some(value) if value.is_string() => Ok(vec![TemplateRef {
            name: value.as_str().unwrap_or_default().to_string(),
            release: None,
        }]),
        Some(value) if value.is_array() => {
            let mut refs = Vec::new();
            for entry in value.as_array().into_iter().flatten() {
                let name = entry.as_str().ok_or_else(|| {
                    PlanError::invalid_templates(job, "template names must be strings")
                })?;
                refs.push(TemplateRef {
                    name: name.to_string(),
                    release: None,
                });
            }
            Ok(refs)
        }
        Some(_) => Err(scoped::<()>(
            Err(ManifestError::invalid_type("template", "string or sequence")),
            prefix,
        )
        .unwrap_err()
        .into()),
    }
}

/// Parse the plural `templates` key, combine with singular refs, and
/// resolve every reference to a concrete template of one release version.
fn parse_templates(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
    job_release: Option<ReleaseKey>,
    singular_refs: Vec<TemplateRef>,
    ctx: &JobContext<'_>,
) -> PlanResult<(ReleaseKey, Vec<Template>)> {
    let mut refs = singular_refs;

    if let Some(entries) = scoped(field::optional_sequence(source, "templates"), prefix)? {
        if !refs.is_empty() {
            return Err(PlanError::invalid_templates(
                job,
                "must not specify both 'template' and 'templates'",
            ));
        }
        for (i, entry) in entries.iter().enumerate() {
            let name = scoped(
                field::required_str(entry, "name"),
                &format!("{prefix}.templates[{i}]"),
            )?;
            let release = scoped(
                field::optional_str(entry, "release"),
                &format!("{prefix}.templates[{i}]"),
            )?;
            refs.push(TemplateRef {
                name: name.to_string(),
                release: release.map(str::to_string),
            });
        }
    }

    if refs.is_empty() {
        return Err(scoped::<()>(Err(ManifestError::missing("template")), prefix)
            .unwrap_err()
            .into());
    }

    // Resolve each reference to a release key; per-entry releases override
    // the job's, and everything must land on the same release version.
    let mut shared_release: Option<ReleaseKey> = None;
    let mut seen_names: HashSet<&str> = HashSet::new();
    let mut templates = Vec::with_capacity(refs.len());

    for template_ref in &refs {
        let release = match &template_ref.release {
            Some(name) => find_release(ctx, name).ok_or_else(|| PlanError::UnknownRelease {
                release: name.clone(),
            })?,
            None => job_release.ok_or_else(|| {
                scoped::<()>(Err(ManifestError::missing("release")), prefix).unwrap_err()
            })?,
        };

        match shared_release {
            None => shared_release = Some(release),
            Some(existing) if existing == release => {}
            Some(_) => {
                return Err(PlanError::invalid_templates(
                    job,
                    "must come from the same release",
                ));
            }
        }

        if !seen_names.insert(template_ref.name.as_str()) {
            return Err(PlanError::invalid_templates(
                job,
                "must not have repeating names",
            ));
        }

        let release_version = &ctx.releases[release];
        let template = release_version
            .find_template(&template_ref.name)
            .ok_or_else(|| {
                PlanError::invalid_templates(
                    job,
                    format!(
                        "template {} not found in release {}",
                        template_ref.name, release_version.name
                    ),
                )
            })?;
        templates.push(template.clone());
    }

    // refs is non-empty, so a shared release was established above.
    let release = shared_release.unwrap_or_default();
    Ok((release, templates))
}

fn parse_disk(source: &ManifestValue, prefix: &str) -> PlanResult<u64> {
    Ok(scoped(field::optional_u64(source, "persistent_disk"), prefix)?.unwrap_or(0))
}

fn parse_properties(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
    templates: &[Template],
    ctx: &JobContext<'_>,
) -> PlanResult<ManifestValue> {
    let mut mappings = BTreeMap::new();
    if let Some(block) = scoped(field::optional_mapping(source, "property_mappings"), prefix)? {
        for (alias, value) in block.as_object().into_iter().flatten() {
            let path = value.as_str().ok_or_else(|| {
                scoped::<()>(
                    Err(ManifestError::invalid_type(
                        &format!("property_mappings.{alias}"),
                        "string",
                    )),
                    prefix,
                )
                .unwrap_err()
            })?;
            mappings.insert(alias.clone(), path.to_string());
        }
    }
    bind_job_properties(job, ctx.deployment_properties, &mappings, templates)
}

fn parse_resource_pool(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
    ctx: &JobContext<'_>,
) -> PlanResult<PoolKey> {
    let pool = scoped(field::required_str(source, "resource_pool"), prefix)?;
    ctx.pools
        .iter()
        .position(|p| p.name == pool)
        .ok_or_else(|| PlanError::UnknownResourcePool {
            job: job.to_string(),
            pool: pool.to_string(),
        })
}

fn parse_update_config(
    source: &ManifestValue,
    prefix: &str,
    ctx: &JobContext<'_>,
) -> PlanResult<UpdateConfig> {
    let block = scoped(field::optional_mapping(source, "update"), prefix)?;
    Ok(scoped(UpdateConfig::parse(block, ctx.default_update), prefix)?)
}

fn parse_instances(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
    ctx: &JobContext<'_>,
) -> PlanResult<Vec<Instance>> {
    let count = scoped(field::required_u32(source, "instances"), prefix)?;
    let mut instances = Vec::with_capacity(count as usize);
    for index in 0..count {
        let mut target_state = TargetState::Started;
        let mut recreate = ctx.options.recreate;
        for or in ctx
            .options
            .job_states
            .iter()
            .filter(|o| o.job == job && o.index == index)
        {
            match or.state {
                OverrideState::Started => target_state = TargetState::Started,
                OverrideState::Stopped => target_state = TargetState::Stopped,
                OverrideState::Detached => target_state = TargetState::Detached,
                OverrideState::Recreate => {
                    target_state = TargetState::Started;
                    recreate = true;
                }
            }
        }
        instances.push(Instance {
            index,
            target_state,
            recreate,
        });
    }
    Ok(instances)
}

fn parse_networks(
    source: &ManifestValue,
    prefix: &str,
    job: &str,
    ctx: &JobContext<'_>,
) -> PlanResult<Vec<JobNetwork>> {
    let entries = scoped(field::required_sequence(source, "networks"), prefix)?;
    let mut networks = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let entry_prefix = format!("{prefix}.networks[{i}]");
        let (name, static_ips) = if let Some(name) = entry.as_str() {
            (name, Vec::new())
        } else {
            let name = scoped(field::required_str(entry, "name"), &entry_prefix)?;
            let mut ips = Vec::new();
            if let Some(list) = scoped(field::optional_sequence(entry, "static_ips"), &entry_prefix)?
            {
                for ip in list {
                    let ip = ip.as_str().ok_or_else(|| {
                        scoped::<()>(
                            Err(ManifestError::invalid_type("static_ips", "string")),
                            &entry_prefix,
                        )
                        .unwrap_err()
                    })?;
                    ips.push(ip.to_string());
                }
            }
            (name, ips)
        };

        let network = ctx
            .networks
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| PlanError::UnknownNetwork {
                job: job.to_string(),
                network: name.to_string(),
            })?;
        networks.push(JobNetwork {
            network,
            static_ips,
        });
    }
    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StemcellId;
    use serde_json::json;

    fn releases() -> Vec<ReleaseVersion> {
        vec![
            ReleaseVersion {
                name: "main".into(),
                version: "7".into(),
                templates: vec![
                    Template {
                        name: "router".into(),
                        properties: None,
                    },
                    Template {
                        name: "worker".into(),
                        properties: None,
                    },
                ],
            },
            ReleaseVersion {
                name: "extras".into(),
                version: "1".into(),
                templates: vec![Template {
                    name: "metrics".into(),
                    properties: None,
                }],
            },
        ]
    }

    fn pools() -> Vec<ResourcePool> {
        vec![ResourcePool {
            name: "default".into(),
            size: 10,
            stemcell: StemcellId {
                name: "ubuntu".into(),
                version: "3586".into(),
            },
            cloud_properties: json!({}),
            network: 0,
        }]
    }

    fn networks() -> Vec<Network> {
        vec![Network {
            name: "default".into(),
            cloud_properties: json!({}),
        }]
    }

    struct Fixture {
        releases: Vec<ReleaseVersion>,
        pools: Vec<ResourcePool>,
        networks: Vec<Network>,
        properties: ManifestValue,
        update: UpdateConfig,
        options: DeployOptions,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                releases: releases(),
                pools: pools(),
                networks: networks(),
                properties: json!({}),
                update: UpdateConfig::default(),
                options: DeployOptions::default(),
            }
        }

        fn ctx(&self) -> JobContext<'_> {
            JobContext {
                releases: &self.releases,
                pools: &self.pools,
                networks: &self.networks,
                deployment_properties: &self.properties,
                default_update: &self.update,
                options: &self.options,
            }
        }
    }

    fn base_job() -> ManifestValue {
        json!({
            "name": "web",
            "template": "router",
            "release": "main",
            "instances": 2,
            "resource_pool": "default",
            "networks": [{"name": "default"}],
        })
    }

    #[test]
    fn parses_minimal_job() {
        let fixture = Fixture::new();
        let job = parse_job(&base_job(), 0, &fixture.ctx()).unwrap();
        assert_eq!(job.name, "web");
        assert_eq!(job.release, 0);
        assert_eq!(job.templates.len(), 1);
        assert_eq!(job.templates[0].name, "router");
        assert_eq!(job.persistent_disk_mb, 0);
        assert_eq!(job.instances.len(), 2);
        assert_eq!(job.instances[1].index, 1);
        assert_eq!(job.instances[0].target_state, TargetState::Started);
        assert!(!job.instances[0].recreate);
    }

    #[test]
    fn template_sequence_preserves_order() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["template"] = json!(["worker", "router"]);
        let job = parse_job(&source, 0, &fixture.ctx()).unwrap();
        let names: Vec<_> = job.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["worker", "router"]);
    }

    #[test]
    fn plural_templates_with_release_overrides_must_share_release() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source.as_object_mut().unwrap().remove("template");
        source["templates"] = json!([
            {"name": "router", "release": "main"},
            {"name": "metrics", "release": "extras"},
        ]);
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::invalid_templates("web", "must come from the same release")
        );
    }

    #[test]
    fn repeated_template_names_rejected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["template"] = json!(["router", "router"]);
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::invalid_templates("web", "must not have repeating names")
        );
    }

    #[test]
    fn both_template_keys_rejected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["templates"] = json!([{"name": "worker"}]);
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTemplates { .. }));
    }

    #[test]
    fn unknown_release_rejected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["release"] = json!("nope");
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownRelease {
                release: "nope".into()
            }
        );
    }

    #[test]
    fn unknown_resource_pool_rejected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["resource_pool"] = json!("huge");
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownResourcePool {
                job: "web".into(),
                pool: "huge".into()
            }
        );
    }

    #[test]
    fn unknown_network_rejected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["networks"] = json!(["dmz"]);
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownNetwork {
                job: "web".into(),
                network: "dmz".into()
            }
        );
    }

    #[test]
    fn missing_name_names_the_path() {
        let fixture = Fixture::new();
        let source = json!({"template": "router"});
        let err = parse_job(&source, 3, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::Manifest(ManifestError::missing("jobs[3].name"))
        );
    }

    #[test]
    fn job_state_overrides_apply_per_index() {
        let mut fixture = Fixture::new();
        fixture.options.job_states = vec![
            JobStateOverride {
                job: "web".into(),
                index: 0,
                state: OverrideState::Stopped,
            },
            JobStateOverride {
                job: "web".into(),
                index: 1,
                state: OverrideState::Recreate,
            },
        ];
        let job = parse_job(&base_job(), 0, &fixture.ctx()).unwrap();
        assert_eq!(job.instances[0].target_state, TargetState::Stopped);
        assert_eq!(job.instances[1].target_state, TargetState::Started);
        assert!(job.instances[1].recreate);
    }

    #[test]
    fn global_recreate_marks_all_instances() {
        let mut fixture = Fixture::new();
        fixture.options.recreate = true;
        let job = parse_job(&base_job(), 0, &fixture.ctx()).unwrap();
        assert!(job.instances.iter().all(|i| i.recreate));
    }

    #[test]
    fn static_ips_are_collected() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["networks"] = json!([{"name": "default", "static_ips": ["10.0.0.5", "10.0.0.6"]}]);
        let job = parse_job(&source, 0, &fixture.ctx()).unwrap();
        assert_eq!(job.networks[0].static_ips, vec!["10.0.0.5", "10.0.0.6"]);
    }

    #[test]
    fn sole_release_is_implied() {
        let mut fixture = Fixture::new();
        fixture.releases.truncate(1);
        let mut source = base_job();
        source.as_object_mut().unwrap().remove("release");
        let job = parse_job(&source, 0, &fixture.ctx()).unwrap();
        assert_eq!(job.release, 0);
    }

    #[test]
    fn ambiguous_release_requires_the_key() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source.as_object_mut().unwrap().remove("release");
        let err = parse_job(&source, 0, &fixture.ctx()).unwrap_err();
        assert_eq!(
            err,
            PlanError::Manifest(ManifestError::missing("jobs[0].release"))
        );
    }

    #[test]
    fn persistent_disk_and_rename() {
        let fixture = Fixture::new();
        let mut source = base_job();
        source["persistent_disk"] = json!(2048);
        source["rename_from"] = json!("old-web");
        let job = parse_job(&source, 0, &fixture.ctx()).unwrap();
        assert_eq!(job.persistent_disk_mb, 2048);
        assert_eq!(job.rename_from.as_deref(), Some("old-web"));
    }
}
