//! The plan graph and the deployment-level manifest parser.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

use flotilla_manifest::{field, mapping, parse_manifest, ManifestError, ManifestValue};

use crate::error::{PlanError, PlanResult};
use crate::job::{parse_job, Job, JobContext, JobStateOverride};
use crate::release::{ReleaseCatalog, ReleaseVersion};
use crate::update_config::UpdateConfig;
use crate::NetworkKey;

/// `(name, version)` identity of a base VM image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StemcellId {
    pub name: String,
    pub version: String,
}

impl fmt::Display for StemcellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A pool of fungible idle VMs sharing a stemcell and cloud properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePool {
    pub name: String,
    pub size: u32,
    pub stemcell: StemcellId,
    pub cloud_properties: ManifestValue,
    pub network: NetworkKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub name: String,
    pub cloud_properties: ManifestValue,
}

/// Caller-supplied knobs for one apply.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Force VM replacement for every instance.
    pub recreate: bool,
    /// Per-`(job, index)` target state overrides.
    pub job_states: Vec<JobStateOverride>,
}

/// The typed model of one deployment apply.
///
/// The plan exclusively owns every entity parsed out of the manifest;
/// cross references are arena keys. It is written only during [`Plan::parse`]
/// and read-only afterwards, so concurrent readers need no locking.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub name: String,
    pub manifest_text: String,
    /// Deployment-level property tree (input to per-job binding).
    pub properties: ManifestValue,
    pub releases: Vec<ReleaseVersion>,
    pub stemcells: Vec<StemcellId>,
    pub networks: Vec<Network>,
    pub resource_pools: Vec<ResourcePool>,
    pub jobs: Vec<Job>,
    pub update: UpdateConfig,
}

impl Plan {
    /// Parse manifest text against the published release catalog.
    ///
    /// Deployment-level sections parse before jobs because job parsing
    /// resolves against them; each job then parses its fields in the fixed
    /// order documented in [`crate::job`].
    pub fn parse(
        manifest_text: &str,
        catalog: &ReleaseCatalog,
        options: &DeployOptions,
    ) -> PlanResult<Plan> {
        let manifest = parse_manifest(manifest_text)?;

        let name = field::required_str(&manifest, "name")?.to_string();
        let releases = parse_releases(&manifest, catalog)?;
        let networks = parse_networks(&manifest)?;
        let resource_pools = parse_resource_pools(&manifest, &networks)?;
        let update = UpdateConfig::parse(
            field::optional_mapping(&manifest, "update")?,
            &UpdateConfig::default(),
        )?;
        let properties = field::optional_mapping(&manifest, "properties")?
            .cloned()
            .unwrap_or_else(mapping);

        let mut jobs = Vec::new();
        if let Some(entries) = field::optional_sequence(&manifest, "jobs")? {
            let ctx = JobContext {
                releases: &releases,
                pools: &resource_pools,
                networks: &networks,
                deployment_properties: &properties,
                default_update: &update,
                options,
            };
            let mut seen = HashSet::new();
            for (i, entry) in entries.iter().enumerate() {
                let job = parse_job(entry, i, &ctx)?;
                if !seen.insert(job.name.clone()) {
                    return Err(ManifestError::invalid_value(
                        "jobs",
                        format!("duplicate job name {}", job.name),
                    )
                    .into());
                }
                jobs.push(job);
            }
        }

        check_pool_capacity(&jobs, &resource_pools)?;

        let mut stemcells = Vec::new();
        for pool in &resource_pools {
            if !stemcells.contains(&pool.stemcell) {
                stemcells.push(pool.stemcell.clone());
            }
        }

        Ok(Plan {
            name,
            manifest_text: manifest_text.to_string(),
            properties,
            releases,
            stemcells,
            networks,
            resource_pools,
            jobs,
            update,
        })
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// The canonical spec of a job's instances: everything whose change
    /// should trigger an update. Hashed by [`spec_digest`].
    pub fn instance_spec(&self, job: &Job) -> ManifestValue {
        let templates: Vec<ManifestValue> = job
            .templates
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "release": self.releases[job.release].key(),
                })
            })
            .collect();
        let networks: Vec<ManifestValue> = job
            .networks
            .iter()
            .map(|n| {
                json!({
                    "name": self.networks[n.network].name,
                    "static_ips": n.static_ips,
                })
            })
            .collect();
        let pool = &self.resource_pools[job.resource_pool];
        json!({
            "deployment": self.name,
            "job": job.name,
            "templates": templates,
            "properties": job.properties,
            "resource_pool": pool.name,
            "stemcell": {"name": pool.stemcell.name, "version": pool.stemcell.version},
            "persistent_disk": job.persistent_disk_mb,
            "networks": networks,
        })
    }
}

/// SHA-256 over the canonical JSON encoding of an instance spec.
///
/// `serde_json`'s default map is ordered, so equal specs hash equally.
pub fn spec_digest(spec: &ManifestValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_releases(
    manifest: &ManifestValue,
    catalog: &ReleaseCatalog,
) -> PlanResult<Vec<ReleaseVersion>> {
    let entries = field::required_sequence(manifest, "releases")?;
    let mut releases = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let prefix = format!("releases[{i}]");
        let name = field::required_str(entry, "name")
            .map_err(|_| ManifestError::missing(format!("{prefix}.name")))?;
        let version = match entry.get("version") {
            Some(v) if v.is_string() => v.as_str().unwrap_or_default().to_string(),
            Some(v) if v.is_number() => v.to_string(),
            Some(_) => {
                return Err(
                    ManifestError::invalid_type(format!("{prefix}.version"), "string").into(),
                )
            }
            None => return Err(ManifestError::missing(format!("{prefix}.version")).into()),
        };
        let release = catalog
            .find(name, &version)
            .ok_or_else(|| PlanError::UnknownRelease {
                release: format!("{name}/{version}"),
            })?;
        releases.push(release.clone());
    }
    Ok(releases)
}

fn parse_networks(manifest: &ManifestValue) -> PlanResult<Vec<Network>> {
    let entries = field::required_sequence(manifest, "networks")?;
    let mut networks = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let prefix = format!("networks[{i}]");
        let name = field::required_str(entry, "name")
            .map_err(|_| ManifestError::missing(format!("{prefix}.name")))?;
        let cloud_properties = field::optional_mapping(entry, "cloud_properties")?
            .cloned()
            .unwrap_or_else(mapping);
        networks.push(Network {
            name: name.to_string(),
            cloud_properties,
        });
    }
    Ok(networks)
}

fn parse_resource_pools(
    manifest: &ManifestValue,
    networks: &[Network],
) -> PlanResult<Vec<ResourcePool>> {
    let entries = field::required_sequence(manifest, "resource_pools")?;
    let mut pools = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let prefix = format!("resource_pools[{i}]");
        let name = field::required_str(entry, "name")
            .map_err(|_| ManifestError::missing(format!("{prefix}.name")))?;
        let size = field::required_u32(entry, "size")
            .map_err(|_| ManifestError::missing(format!("{prefix}.size")))?;
        let stemcell_name = field::required_str(entry, "stemcell.name")
            .map_err(|_| ManifestError::missing(format!("{prefix}.stemcell.name")))?;
        let stemcell_version = field::required_str(entry, "stemcell.version")
            .map_err(|_| ManifestError::missing(format!("{prefix}.stemcell.version")))?;
        let cloud_properties = field::optional_mapping(entry, "cloud_properties")?
            .cloned()
            .unwrap_or_else(mapping);
        let network_name = field::required_str(entry, "network")
            .map_err(|_| ManifestError::missing(format!("{prefix}.network")))?;
        let network = networks
            .iter()
            .position(|n| n.name == network_name)
            .ok_or_else(|| PlanError::UnknownNetwork {
                job: format!("resource pool {name}"),
                network: network_name.to_string(),
            })?;
        pools.push(ResourcePool {
            name: name.to_string(),
            size,
            stemcell: StemcellId {
                name: stemcell_name.to_string(),
                version: stemcell_version.to_string(),
            },
            cloud_properties,
            network,
        });
    }
    Ok(pools)
}

/// Invariant: the instances of all jobs assigned to a pool fit in the pool.
fn check_pool_capacity(jobs: &[Job], pools: &[ResourcePool]) -> PlanResult<()> {
    let mut needed: HashMap<usize, u32> = HashMap::new();
    for job in jobs {
        *needed.entry(job.resource_pool).or_insert(0) += job.instances.len() as u32;
    }
    for (pool_key, needed) in needed {
        let pool = &pools[pool_key];
        if needed > pool.size {
            return Err(PlanError::PoolCapacityExceeded {
                pool: pool.name.clone(),
                needed,
                size: pool.size,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{PropertyDef, Template};
    use std::collections::BTreeMap;

    fn catalog() -> ReleaseCatalog {
        ReleaseCatalog::new(vec![ReleaseVersion {
            name: "main".into(),
            version: "7".into(),
            templates: vec![
                Template {
                    name: "router".into(),
                    properties: None,
                },
                Template {
                    name: "worker".into(),
                    properties: Some(BTreeMap::from([(
                        "queue_depth".to_string(),
                        PropertyDef {
                            default: Some(json!(64)),
                            required: false,
                        },
                    )])),
                },
            ],
        }])
    }

    const MANIFEST: &str = r#"
name: prod
releases:
- name: main
  version: 7
networks:
- name: default
resource_pools:
- name: small
  size: 8
  stemcell:
    name: ubuntu
    version: "3586"
  network: default
update:
  canaries: 2
  max_in_flight: 3
  canary_watch_time: 1000-30000
  update_watch_time: 1000-30000
jobs:
- name: web
  template: router
  instances: 3
  resource_pool: small
  networks:
  - name: default
- name: worker
  template: worker
  instances: 2
  resource_pool: small
  persistent_disk: 1024
  networks:
  - name: default
  update:
    serial: false
"#;

    #[test]
    fn parses_full_manifest() {
        let plan = Plan::parse(MANIFEST, &catalog(), &DeployOptions::default()).unwrap();
        assert_eq!(plan.name, "prod");
        assert_eq!(plan.releases.len(), 1);
        assert_eq!(plan.networks.len(), 1);
        assert_eq!(plan.resource_pools.len(), 1);
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.stemcells.len(), 1);
        assert_eq!(plan.stemcells[0].to_string(), "ubuntu/3586");

        let web = plan.job("web").unwrap();
        assert_eq!(web.update.canaries, 2);
        assert_eq!(web.update.max_in_flight, 3);
        assert!(web.update.serial);

        let worker = plan.job("worker").unwrap();
        assert!(!worker.update.serial);
        assert_eq!(worker.persistent_disk_mb, 1024);
        // Template schema default flows through binding.
        assert_eq!(worker.properties, json!({"queue_depth": 64}));
    }

    #[test]
    fn numeric_release_version_is_accepted() {
        let plan = Plan::parse(MANIFEST, &catalog(), &DeployOptions::default()).unwrap();
        assert_eq!(plan.releases[0].version, "7");
    }

    #[test]
    fn release_missing_from_catalog_is_unknown() {
        let err = Plan::parse(MANIFEST, &ReleaseCatalog::default(), &DeployOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownRelease {
                release: "main/7".into()
            }
        );
    }

    #[test]
    fn missing_name_is_reported() {
        let err = Plan::parse("{}", &catalog(), &DeployOptions::default()).unwrap_err();
        assert_eq!(err, PlanError::Manifest(ManifestError::missing("name")));
    }

    #[test]
    fn duplicate_job_names_rejected() {
        let manifest = MANIFEST.replace("name: worker\n  template: worker", "name: web\n  template: worker");
        let err = Plan::parse(&manifest, &catalog(), &DeployOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Manifest(ManifestError::InvalidValue { .. })
        ));
    }

    #[test]
    fn pool_capacity_is_enforced() {
        let manifest = MANIFEST.replace("size: 8", "size: 4");
        let err = Plan::parse(&manifest, &catalog(), &DeployOptions::default()).unwrap_err();
        assert_eq!(
            err,
            PlanError::PoolCapacityExceeded {
                pool: "small".into(),
                needed: 5,
                size: 4,
            }
        );
    }

    #[test]
    fn pool_with_unknown_network_rejected() {
        let manifest = MANIFEST.replace("  network: default", "  network: dmz");
        let err = Plan::parse(&manifest, &catalog(), &DeployOptions::default()).unwrap_err();
        assert!(matches!(err, PlanError::UnknownNetwork { .. }));
    }

    #[test]
    fn spec_digest_is_stable_and_sensitive() {
        let plan = Plan::parse(MANIFEST, &catalog(), &DeployOptions::default()).unwrap();
        let web = plan.job("web").unwrap();
        let digest_a = spec_digest(&plan.instance_spec(web));
        let digest_b = spec_digest(&plan.instance_spec(web));
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 64);

        // A property change must change the digest.
        let manifest = MANIFEST.replace("version: \"3586\"", "version: \"3600\"");
        let plan2 = Plan::parse(&manifest, &catalog(), &DeployOptions::default()).unwrap();
        let digest_c = spec_digest(&plan2.instance_spec(plan2.job("web").unwrap()));
        assert_ne!(digest_a, digest_c);
    }

    #[test]
    fn recreate_option_reaches_instances() {
        let options = DeployOptions {
            recreate: true,
            job_states: Vec::new(),
        };
        let plan = Plan::parse(MANIFEST, &catalog(), &options).unwrap();
        assert!(plan
            .jobs
            .iter()
            .flat_map(|j| &j.instances)
            .all(|i| i.recreate));
    }
}
