//! Deployment and release locks.
//!
//! The deployment lock is exclusive per deployment name and held for the
//! whole apply. Release locks are shared per release name and held only
//! around the final commit. Both are try-acquire: an unavailable lock is an
//! immediate error, never a wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Exclusive,
    Shared(u32),
}

#[derive(Debug, Default)]
struct LockTable {
    deployments: HashMap<String, LockState>,
    releases: HashMap<String, LockState>,
}

/// In-process lock manager.
///
/// Stands in for the external distributed lock manager behind the same
/// guard-based interface; guards release their lock on drop.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive per-deployment lock.
    pub fn lock_deployment(&self, name: &str) -> Result<DeploymentLockGuard, LockError> {
        let mut table = lock_table(&self.table);
        if table.deployments.contains_key(name) {
            return Err(LockError::Unavailable(format!("deployment {name}")));
        }
        table
            .deployments
            .insert(name.to_string(), LockState::Exclusive);
        debug!(deployment = %name, "deployment lock acquired");
        Ok(DeploymentLockGuard {
            manager: self.clone(),
            name: name.to_string(),
        })
    }

    /// Acquire a shared per-release lock.
    pub fn lock_release(&self, name: &str) -> Result<ReleaseLockGuard, LockError> {
        let mut table = lock_table(&self.table);
        match table.releases.get_mut(name) {
            None => {
                table.releases.insert(name.to_string(), LockState::Shared(1));
            }
            Some(LockState::Shared(count)) => *count += 1,
            Some(LockState::Exclusive) => {
                return Err(LockError::Unavailable(format!("release {name}")));
            }
        }
        debug!(release = %name, "release lock acquired");
        Ok(ReleaseLockGuard {
            manager: self.clone(),
            name: name.to_string(),
        })
    }

    fn unlock_deployment(&self, name: &str) {
        let mut table = lock_table(&self.table);
        table.deployments.remove(name);
        debug!(deployment = %name, "deployment lock released");
    }

    fn unlock_release(&self, name: &str) {
        let mut table = lock_table(&self.table);
        if let Some(LockState::Shared(count)) = table.releases.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                table.releases.remove(name);
            }
        }
        debug!(release = %name, "release lock released");
    }
}

/// Recover the table even if a holder panicked while locking.
fn lock_table(table: &Arc<Mutex<LockTable>>) -> std::sync::MutexGuard<'_, LockTable> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for the exclusive deployment lock.
#[derive(Debug)]
pub struct DeploymentLockGuard {
    manager: LockManager,
    name: String,
}

impl Drop for DeploymentLockGuard {
    fn drop(&mut self) {
        self.manager.unlock_deployment(&self.name);
    }
}

/// RAII guard for a shared release lock.
pub struct ReleaseLockGuard {
    manager: LockManager,
    name: String,
}

impl Drop for ReleaseLockGuard {
    fn drop(&mut self) {
        self.manager.unlock_release(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_lock_is_exclusive() {
        let locks = LockManager::new();
        let guard = locks.lock_deployment("prod").unwrap();

        let err = locks.lock_deployment("prod").unwrap_err();
        assert_eq!(err, LockError::Unavailable("deployment prod".into()));

        // Other deployments are unaffected.
        let _other = locks.lock_deployment("staging").unwrap();

        drop(guard);
        let _again = locks.lock_deployment("prod").unwrap();
    }

    #[test]
    fn release_locks_are_shared() {
        let locks = LockManager::new();
        let a = locks.lock_release("main").unwrap();
        let b = locks.lock_release("main").unwrap();

        drop(a);
        // Still held by b.
        let c = locks.lock_release("main").unwrap();
        drop(b);
        drop(c);
    }

    #[test]
    fn guards_release_on_drop() {
        let locks = LockManager::new();
        {
            let _guard = locks.lock_deployment("prod").unwrap();
        }
        assert!(locks.lock_deployment("prod").is_ok());
    }
}
