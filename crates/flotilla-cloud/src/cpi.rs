//! Cloud provider interface — VM and disk lifecycle calls.

use async_trait::async_trait;

use flotilla_manifest::ManifestValue;
use flotilla_plan::StemcellId;

use crate::error::CloudResult;

/// The cloud adapter consumed by the orchestrator.
///
/// Calls are request/response and may be long-running (VM creation
/// routinely takes minutes); the orchestrator treats every call as a
/// suspension point. Retries are up to the caller.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a VM from a stemcell. Returns the VM cloud ID.
    async fn create_vm(
        &self,
        stemcell: &StemcellId,
        cloud_properties: &ManifestValue,
        networks: &ManifestValue,
        disk_cids: &[String],
    ) -> CloudResult<String>;

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()>;

    /// Create a persistent disk. Returns the disk cloud ID.
    async fn create_disk(
        &self,
        size_mb: u64,
        cloud_properties: &ManifestValue,
    ) -> CloudResult<String>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    /// Snapshot a disk. Returns the snapshot cloud ID.
    async fn snapshot_disk(&self, disk_cid: &str) -> CloudResult<String>;
}
