//! redb table definitions for the flotilla state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the patterns noted per table.

use redb::TableDefinition;

/// Deployment records keyed by `{name}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Published release versions keyed by `{name}/{version}`.
pub const RELEASE_VERSIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("release_versions");

/// Stemcell-to-deployment join rows keyed by `{name}/{version}:{deployment}`.
pub const STEMCELL_REFS: TableDefinition<&str, &[u8]> = TableDefinition::new("stemcell_refs");

/// Instance records keyed by `{deployment}/{job}/{index}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// VM records keyed by `{vm_cid}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Persistent disk records keyed by `{disk_cid}`.
pub const DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("disks");
