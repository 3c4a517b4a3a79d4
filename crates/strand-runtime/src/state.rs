use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::{ExecutorId, PortableValue, ScopeKey};

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct StoredKey {
    executor: String,
    scope: Option<String>,
    key: String,
}

impl StoredKey {
    fn from_scope_key(key: &ScopeKey) -> Self {
        Self {
            executor: key.executor_id.0.clone(),
            scope: key.scope.clone(),
            key: key.key.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StateInner {
    values: HashMap<StoredKey, PortableValue>,
    /// First-writer ownership per named (shared) scope key. The default
    /// scope is private per executor and never registered here.
    owners: HashMap<(String, String), ExecutorId>,
}

/// One stored entry in a portable state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub executor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub key: String,
    pub value: PortableValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub scope: String,
    pub key: String,
    pub executor_id: String,
}

/// Portable snapshot of the full state-manager contents, including the
/// owning-executor registry so conflict detection stays correct after a
/// restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entries: Vec<StateEntry>,
    pub owners: Vec<OwnerEntry>,
}

/// Durable per-executor state, addressed by `(executor, scope, key)`.
///
/// A named scope is shared across executors but admits only one writer per
/// `(scope, key)` pair for the workflow's lifetime; ownership is established
/// dynamically by first write and a second writer fails fast. Reads never
/// fail on a missing key.
///
/// All operations are internally synchronized, so the single-writer rule
/// holds under the concurrent execution strategy.
#[derive(Debug, Default)]
pub struct ScopeKeyedStateManager {
    inner: Mutex<StateInner>,
}

impl ScopeKeyedStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // A poisoned lock only means a writer panicked mid-update of plain
        // maps; the data is still structurally sound.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a value. `None` means "uninitialized", never an error.
    pub fn read(&self, key: &ScopeKey) -> Option<PortableValue> {
        self.lock().values.get(&StoredKey::from_scope_key(key)).cloned()
    }

    /// Write a value, or clear the key with `None`.
    ///
    /// Rejects the write with [`StrandError::StateConflict`] if the key's
    /// named scope is already owned by a different executor.
    pub fn write(&self, key: &ScopeKey, value: Option<PortableValue>) -> Result<()> {
        let mut inner = self.lock();

        if let Some(scope) = &key.scope {
            let owner_key = (scope.clone(), key.key.clone());
            match inner.owners.get(&owner_key) {
                Some(owner) if owner != &key.executor_id => {
                    return Err(StrandError::StateConflict {
                        scope: scope.clone(),
                        key: key.key.clone(),
                        owner: owner.0.clone(),
                        writer: key.executor_id.0.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    inner.owners.insert(owner_key, key.executor_id.clone());
                }
            }
        }

        let stored = StoredKey::from_scope_key(key);
        match value {
            Some(value) => {
                inner.values.insert(stored, value);
            }
            None => {
                inner.values.remove(&stored);
            }
        }
        Ok(())
    }

    /// Keys held by `executor_id` in the given scope.
    pub fn read_keys(&self, executor_id: &ExecutorId, scope: Option<&str>) -> BTreeSet<String> {
        self.lock()
            .values
            .keys()
            .filter(|k| k.executor == executor_id.0 && k.scope.as_deref() == scope)
            .map(|k| k.key.clone())
            .collect()
    }

    /// Remove every value `executor_id` holds in the given scope. Ownership
    /// registrations persist — they span the workflow's lifetime.
    pub fn clear(&self, executor_id: &ExecutorId, scope: Option<&str>) {
        self.lock()
            .values
            .retain(|k, _| !(k.executor == executor_id.0 && k.scope.as_deref() == scope));
    }

    /// Serialize the full contents, values and owner registry both.
    pub fn export(&self) -> StateSnapshot {
        let inner = self.lock();

        let mut entries: Vec<StateEntry> = inner
            .values
            .iter()
            .map(|(k, v)| StateEntry {
                executor_id: k.executor.clone(),
                scope: k.scope.clone(),
                key: k.key.clone(),
                value: v.clone(),
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.executor_id, &a.scope, &a.key).cmp(&(&b.executor_id, &b.scope, &b.key))
        });

        let mut owners: Vec<OwnerEntry> = inner
            .owners
            .iter()
            .map(|((scope, key), executor)| OwnerEntry {
                scope: scope.clone(),
                key: key.clone(),
                executor_id: executor.0.clone(),
            })
            .collect();
        owners.sort_by(|a, b| (&a.scope, &a.key).cmp(&(&b.scope, &b.key)));

        StateSnapshot { entries, owners }
    }

    /// Replace the full contents from a snapshot in one atomic operation.
    pub fn import(&self, snapshot: StateSnapshot) {
        let mut inner = self.lock();
        debug!(
            entries = snapshot.entries.len(),
            owners = snapshot.owners.len(),
            "importing state snapshot"
        );

        inner.values = snapshot
            .entries
            .into_iter()
            .map(|entry| {
                (
                    StoredKey {
                        executor: entry.executor_id,
                        scope: entry.scope,
                        key: entry.key,
                    },
                    entry.value,
                )
            })
            .collect();
        inner.owners = snapshot
            .owners
            .into_iter()
            .map(|owner| ((owner.scope, owner.key), ExecutorId(owner.executor_id)))
            .collect();
    }
}
