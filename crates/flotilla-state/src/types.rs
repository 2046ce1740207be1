//! Persisted domain types for the flotilla state store.

use serde::{Deserialize, Serialize};

use flotilla_plan::StemcellId;

/// Reference to a published release version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

impl ReleaseRef {
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// The persisted truth about one deployment: the last successfully applied
/// manifest and the exact release/stemcell sets it used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    pub manifest: String,
    pub release_versions: Vec<ReleaseRef>,
    pub stemcells: Vec<StemcellId>,
    /// Unix timestamp (seconds) of the last successful apply.
    pub updated_at: u64,
}

impl DeploymentRecord {
    pub fn table_key(&self) -> String {
        self.name.clone()
    }
}

/// Lifecycle state of an instance as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Pending,
    Started,
    Stopped,
    Detached,
}

/// A `(deployment, job, index)` slot and what currently backs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    pub state: InstanceLifecycle,
    pub vm_cid: Option<String>,
    pub disk_cid: Option<String>,
    /// Digest of the spec this instance currently runs.
    pub spec_digest: String,
    /// Digest of the network topology slice of the spec. A change here
    /// forces recreation instead of an in-place update.
    #[serde(default)]
    pub network_digest: String,
    pub updated_at: u64,
}

impl InstanceRecord {
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.job, self.index)
    }
}

/// Build the composite key for the instances table.
pub fn instance_key(deployment: &str, job: &str, index: u32) -> String {
    format!("{deployment}/{job}/{index}")
}

/// The `(job, index)` owner of a VM. VMs without an owner are idle in
/// their resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOwner {
    pub job: String,
    pub index: u32,
}

/// A VM known to the cloud, owned either by an instance or by a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub cid: String,
    pub agent_id: String,
    pub deployment: String,
    pub resource_pool: String,
    pub stemcell: StemcellId,
    pub owner: Option<VmOwner>,
    pub created_at: u64,
}

impl VmRecord {
    pub fn table_key(&self) -> String {
        self.cid.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.owner.is_none()
    }
}

/// A persistent disk and the instance slot it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub cid: String,
    pub deployment: String,
    pub job: String,
    pub index: u32,
    pub size_mb: u64,
    /// False once detached; retained for operator recovery.
    pub active: bool,
    pub created_at: u64,
}

impl DiskRecord {
    pub fn table_key(&self) -> String {
        self.cid.clone()
    }
}

/// Join row recording that a deployment uses a stemcell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellRef {
    pub stemcell: StemcellId,
    pub deployment: String,
}

impl StemcellRef {
    pub fn table_key(&self) -> String {
        stemcell_ref_key(&self.stemcell, &self.deployment)
    }
}

/// Build the composite key for the stemcell_refs table.
pub fn stemcell_ref_key(stemcell: &StemcellId, deployment: &str) -> String {
    format!("{}/{}:{}", stemcell.name, stemcell.version, deployment)
}
