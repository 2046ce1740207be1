//! Deployment plan — the typed model an apply runs against.
//!
//! A `Plan` is parsed from a manifest plus a release catalog. It owns every
//! entity derived from the manifest (releases, jobs, resource pools,
//! networks, instances, stemcells) in arenas and cross-links them with
//! stable keys instead of owning references. The plan is built single-writer
//! during parsing and read-only afterwards.
//!
//! # Components
//!
//! - **`release`** — release catalog types (release versions, templates, property schemas)
//! - **`update_config`** — canary/batch rollout parameters with watch-time ranges
//! - **`properties`** — property binder (schema union, defaults, mappings)
//! - **`job`** — job groups, instances, target states
//! - **`plan`** — the plan graph and the manifest parser

pub mod error;
pub mod job;
pub mod plan;
pub mod properties;
pub mod release;
pub mod update_config;

pub use error::{PlanError, PlanResult};
pub use job::{Instance, Job, JobNetwork, JobStateOverride, OverrideState, TargetState};
pub use plan::{spec_digest, DeployOptions, Network, Plan, ResourcePool, StemcellId};
pub use release::{PropertyDef, ReleaseCatalog, ReleaseVersion, Template};
pub use update_config::{UpdateConfig, WatchTime};

/// Key of a release in the plan's release arena.
pub type ReleaseKey = usize;
/// Key of a resource pool in the plan's pool arena.
pub type PoolKey = usize;
/// Key of a network in the plan's network arena.
pub type NetworkKey = usize;
