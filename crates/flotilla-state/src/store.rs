//! StateStore — redb-backed fleet state persistence.
//!
//! Provides typed CRUD over deployments, release versions, stemcell
//! references, instances, VMs, and disks. The deployment commit and the
//! stemcell reference reconciliation are multi-table write transactions so
//! a crash never leaves a half-published deployment.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use flotilla_plan::{ReleaseVersion, StemcellId};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(RELEASE_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(VMS).map_err(map_err!(Table))?;
        txn.open_table(DISKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Get a deployment by name.
    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        read_value(&table, name)
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        read_all(&table)
    }

    /// Commit a successful apply: rewrite the deployment row and its
    /// stemcell join rows in one transaction. Never partially published.
    pub fn commit_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(record.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut refs = txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
            rewrite_stemcell_refs(&mut refs, &record.name, &record.stemcells)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %record.name, "deployment committed");
        Ok(())
    }

    /// Delete a deployment and its stemcell joins. Returns true if it existed.
    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
            let mut refs = txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
            rewrite_stemcell_refs(&mut refs, name, &[])?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Release versions ───────────────────────────────────────────

    /// Publish a release version. Idempotent for identical content.
    pub fn put_release_version(&self, release: &ReleaseVersion) -> StateResult<()> {
        let key = release.key();
        let value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASE_VERSIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "release version stored");
        Ok(())
    }

    /// Get a release version by name and version.
    pub fn get_release_version(
        &self,
        name: &str,
        version: &str,
    ) -> StateResult<Option<ReleaseVersion>> {
        let key = format!("{name}/{version}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASE_VERSIONS).map_err(map_err!(Table))?;
        read_value(&table, &key)
    }

    /// List all published release versions.
    pub fn list_release_versions(&self) -> StateResult<Vec<ReleaseVersion>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASE_VERSIONS).map_err(map_err!(Table))?;
        read_all(&table)
    }

    /// Delete a release version, refusing while any deployment references it.
    pub fn delete_release_version(&self, name: &str, version: &str) -> StateResult<bool> {
        let key = format!("{name}/{version}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for entry in deployments.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: DeploymentRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.release_versions.iter().any(|r| r.key() == key) {
                    return Err(StateError::InUse(format!(
                        "release {key} is used by deployment {}",
                        record.name
                    )));
                }
            }
            let mut table = txn.open_table(RELEASE_VERSIONS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Stemcell references ────────────────────────────────────────

    /// Deployments currently referencing a stemcell (via join rows).
    pub fn stemcell_deployments(&self, stemcell: &StemcellId) -> StateResult<Vec<String>> {
        let prefix = format!("{}/{}:", stemcell.name, stemcell.version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let r: StemcellRef =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(r.deployment);
            }
        }
        Ok(results)
    }

    /// Stemcells a deployment currently references.
    pub fn deployment_stemcells(&self, deployment: &str) -> StateResult<Vec<StemcellId>> {
        let suffix = format!(":{deployment}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().ends_with(&suffix) {
                let r: StemcellRef =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(r.stemcell);
            }
        }
        Ok(results)
    }

    /// Reconcile a deployment's stemcell join rows to exactly `in_use`.
    /// Rows for stemcells the deployment no longer uses are removed.
    pub fn update_stemcell_references(
        &self,
        deployment: &str,
        in_use: &[StemcellId],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut refs = txn.open_table(STEMCELL_REFS).map_err(map_err!(Table))?;
            rewrite_stemcell_refs(&mut refs, deployment, in_use)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment, count = in_use.len(), "stemcell references reconciled");
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by its `(deployment, job, index)` identity.
    pub fn get_instance(
        &self,
        deployment: &str,
        job: &str,
        index: u32,
    ) -> StateResult<Option<InstanceRecord>> {
        let key = instance_key(deployment, job, index);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        read_value(&table, &key)
    }

    /// List all instances of a deployment.
    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<InstanceRecord>> {
        let prefix = format!("{deployment}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        read_prefix(&table, &prefix)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, deployment: &str, job: &str, index: u32) -> StateResult<bool> {
        let key = instance_key(deployment, job, index);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Migrate all records of a renamed job to the new name in one
    /// transaction (instances, VM owners, disks).
    pub fn migrate_job(
        &self,
        deployment: &str,
        old_job: &str,
        new_job: &str,
    ) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut migrated = 0;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let prefix = format!("{deployment}/{old_job}/");
            let old: Vec<InstanceRecord> = read_prefix(&instances, &prefix)?;
            for mut record in old {
                instances
                    .remove(record.table_key().as_str())
                    .map_err(map_err!(Write))?;
                record.job = new_job.to_string();
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                instances
                    .insert(record.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                migrated += 1;
            }

            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let all_vms: Vec<VmRecord> = read_all(&vms)?;
            for mut vm in all_vms {
                let owned = vm.deployment == deployment
                    && vm.owner.as_ref().is_some_and(|o| o.job == old_job);
                if owned {
                    if let Some(owner) = vm.owner.as_mut() {
                        owner.job = new_job.to_string();
                    }
                    let value = serde_json::to_vec(&vm).map_err(map_err!(Serialize))?;
                    vms.insert(vm.cid.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }

            let mut disks = txn.open_table(DISKS).map_err(map_err!(Table))?;
            let all_disks: Vec<DiskRecord> = read_all(&disks)?;
            for mut disk in all_disks {
                if disk.deployment == deployment && disk.job == old_job {
                    disk.job = new_job.to_string();
                    let value = serde_json::to_vec(&disk).map_err(map_err!(Serialize))?;
                    disks
                        .insert(disk.cid.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment, %old_job, %new_job, migrated, "job records migrated");
        Ok(migrated)
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Insert or update a VM record.
    pub fn put_vm(&self, record: &VmRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            table
                .insert(record.cid.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a VM by cloud ID.
    pub fn get_vm(&self, cid: &str) -> StateResult<Option<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        read_value(&table, cid)
    }

    /// List all VMs of a deployment.
    pub fn list_vms(&self, deployment: &str) -> StateResult<Vec<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        let all: Vec<VmRecord> = read_all(&table)?;
        Ok(all.into_iter().filter(|v| v.deployment == deployment).collect())
    }

    /// List idle (unowned) VMs of one resource pool.
    pub fn list_idle_vms(&self, deployment: &str, pool: &str) -> StateResult<Vec<VmRecord>> {
        Ok(self
            .list_vms(deployment)?
            .into_iter()
            .filter(|v| v.resource_pool == pool && v.is_idle())
            .collect())
    }

    /// Atomically claim an idle VM of a pool on the given stemcell for an
    /// instance slot. The find-and-own happens inside one write
    /// transaction, so concurrent claimants never share a VM. Returns the
    /// claimed record, or `None` when no idle VM matches.
    pub fn claim_idle_vm(
        &self,
        deployment: &str,
        pool: &str,
        stemcell: &StemcellId,
        owner: &VmOwner,
    ) -> StateResult<Option<VmRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut claimed = None;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            let candidates: Vec<VmRecord> = read_all(&table)?;
            let found = candidates.into_iter().find(|v| {
                v.deployment == deployment
                    && v.resource_pool == pool
                    && v.is_idle()
                    && v.stemcell == *stemcell
            });
            if let Some(mut vm) = found {
                vm.owner = Some(owner.clone());
                let value = serde_json::to_vec(&vm).map_err(map_err!(Serialize))?;
                table
                    .insert(vm.cid.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                claimed = Some(vm);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Find the VM owned by an instance slot.
    pub fn find_vm_for_instance(
        &self,
        deployment: &str,
        job: &str,
        index: u32,
    ) -> StateResult<Option<VmRecord>> {
        Ok(self.list_vms(deployment)?.into_iter().find(|v| {
            v.owner
                .as_ref()
                .is_some_and(|o| o.job == job && o.index == index)
        }))
    }

    /// Delete a VM record. Returns true if it existed.
    pub fn delete_vm(&self, cid: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            existed = table.remove(cid).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Disks ──────────────────────────────────────────────────────

    /// Insert or update a disk record.
    pub fn put_disk(&self, record: &DiskRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DISKS).map_err(map_err!(Table))?;
            table
                .insert(record.cid.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a disk by cloud ID.
    pub fn get_disk(&self, cid: &str) -> StateResult<Option<DiskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISKS).map_err(map_err!(Table))?;
        read_value(&table, cid)
    }

    /// Find the active disk of an instance slot.
    pub fn find_active_disk(
        &self,
        deployment: &str,
        job: &str,
        index: u32,
    ) -> StateResult<Option<DiskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISKS).map_err(map_err!(Table))?;
        let all: Vec<DiskRecord> = read_all(&table)?;
        Ok(all.into_iter().find(|d| {
            d.deployment == deployment && d.job == job && d.index == index && d.active
        }))
    }

    /// Delete a disk record. Returns true if it existed.
    pub fn delete_disk(&self, cid: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DISKS).map_err(map_err!(Table))?;
            existed = table.remove(cid).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

// ── Table helpers ──────────────────────────────────────────────────

fn read_value<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn read_all<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn read_prefix<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
    }
    Ok(results)
}

/// Rewrite a deployment's join rows inside an open write transaction.
fn rewrite_stemcell_refs(
    refs: &mut redb::Table<'_, &'static str, &'static [u8]>,
    deployment: &str,
    in_use: &[StemcellId],
) -> StateResult<()> {
    let suffix = format!(":{deployment}");
    let stale: Vec<String> = refs
        .iter()
        .map_err(map_err!(Read))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let k = key.value().to_string();
            k.ends_with(&suffix).then_some(k)
        })
        .collect();
    for key in &stale {
        refs.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    for stemcell in in_use {
        let row = StemcellRef {
            stemcell: stemcell.clone(),
            deployment: deployment.to_string(),
        };
        let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
        refs.insert(row.table_key().as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}
