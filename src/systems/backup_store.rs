use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};

use crate::models::{BackupRecord, EngineError};
use crate::utils::{copy_tree, fingerprint, path_hash, remove_path};

const INDEX_FILE: &str = "index.json";

/// Holds pre-images of mutated paths. One stored copy per record, named
/// `<operation_id>-<path hash>` inside the backups directory.
pub struct BackupStore {
    root: PathBuf,
    records: DashMap<String, BackupRecord>,
    by_operation_path: DashMap<(String, PathBuf), String>,
    // Operations between their first `save` and registration or cleanup.
    pending: DashMap<String, ()>,
    // Serializes saves of the same (operation, path) while the copy runs.
    save_locks: DashMap<(String, PathBuf), Arc<Mutex<()>>>,
    flush_lock: Mutex<()>,
}

/// Keeps an operation's backups out of orphan sweeps until dropped.
pub struct PendingGuard<'a> {
    store: &'a BackupStore,
    operation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.store.pending.remove(&self.operation_id);
    }
}

impl BackupStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let store = Self {
            root,
            records: DashMap::new(),
            by_operation_path: DashMap::new(),
            pending: DashMap::new(),
            save_locks: DashMap::new(),
            flush_lock: Mutex::new(()),
        };

        let index_path = store.root.join(INDEX_FILE);
        if index_path.exists() {
            let content = fs::read_to_string(&index_path)?;
            match serde_json::from_str::<Vec<BackupRecord>>(&content) {
                Ok(records) => {
                    for record in records {
                        store
                            .by_operation_path
                            .insert((record.operation_id.clone(), record.original_path.clone()), record.backup_id.clone());
                        store.records.insert(record.backup_id.clone(), record);
                    }
                    info!("Loaded {} backup records from {:?}", store.records.len(), index_path);
                }
                Err(e) => {
                    log::error!("Failed to parse backup index {:?}: {}", index_path, e);
                    return Ok(store);
                }
            }
        }
        store.remove_unindexed()?;
        Ok(store)
    }

    /// Deletes stored copies the index does not know about, left behind by a
    /// run that stopped before writing its index.
    fn remove_unindexed(&self) -> Result<(), EngineError> {
        let indexed: HashSet<std::ffi::OsString> = self
            .records
            .iter()
            .filter_map(|r| r.stored_copy_path.as_ref().and_then(|p| p.file_name()).map(|n| n.to_os_string()))
            .collect();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == INDEX_FILE || indexed.contains(&name) {
                continue;
            }
            info!("Removing unindexed backup {:?}", entry.path());
            if let Err(e) = remove_path(&entry.path()) {
                warn!("Could not remove {:?}: {}", entry.path(), e);
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn begin(&self, operation_id: &str) -> PendingGuard<'_> {
        self.pending.insert(operation_id.to_string(), ());
        PendingGuard {
            store: self,
            operation_id: operation_id.to_string(),
        }
    }

    /// Captures the current state of `path` for `operation_id`. A missing path
    /// yields a record with no stored copy. Calling it again for the same
    /// operation and path returns the first record.
    pub fn save(&self, operation_id: &str, path: &Path) -> Result<BackupRecord, EngineError> {
        let key = (operation_id.to_string(), path.to_path_buf());
        let lock = self.save_locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _held = lock.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(backup_id) = self.by_operation_path.get(&key).map(|id| id.clone()) {
            return self
                .records
                .get(&backup_id)
                .map(|r| r.clone())
                .ok_or_else(|| EngineError::NotFound(format!("backup {}", backup_id)));
        }

        let backup_id = uuid::Uuid::new_v4().to_string();
        let stored_copy_path = if fs::symlink_metadata(path).is_ok() {
            let stored = self.root.join(format!("{}-{}", operation_id, path_hash(path)));
            remove_path(&stored)?;
            copy_tree(path, &stored)?;
            Some(stored)
        } else {
            None
        };

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            operation_id: operation_id.to_string(),
            original_path: path.to_path_buf(),
            stored_copy_path,
            created_at: Utc::now(),
            sealed: None,
        };
        debug!("Backed up {:?} as {} (absent: {})", path, backup_id, record.is_absence_marker());
        self.records.insert(backup_id.clone(), record.clone());
        self.by_operation_path.insert(key, backup_id);
        Ok(record)
    }

    /// Records the post-operation state of the record's path. Restores refuse
    /// to run over anything different.
    pub fn seal(&self, backup_id: &str) -> Result<(), EngineError> {
        let path = self
            .records
            .get(backup_id)
            .map(|r| r.original_path.clone())
            .ok_or_else(|| EngineError::NotFound(format!("backup {}", backup_id)))?;
        let state = fingerprint(&path)?;
        if let Some(mut record) = self.records.get_mut(backup_id) {
            record.sealed = Some(state);
        }
        Ok(())
    }

    pub fn get(&self, backup_id: &str) -> Option<BackupRecord> {
        self.records.get(backup_id).map(|r| r.clone())
    }

    /// Fails with `RestoreConflict` when the path no longer looks the way the
    /// operation left it.
    pub fn verify(&self, record: &BackupRecord) -> Result<(), EngineError> {
        if let Some(ref sealed) = record.sealed {
            let current = fingerprint(&record.original_path)?;
            if current != *sealed {
                return Err(EngineError::RestoreConflict(format!(
                    "{} was modified after the operation",
                    record.original_path.display()
                )));
            }
        }
        if let Some(ref stored) = record.stored_copy_path {
            if fs::symlink_metadata(stored).is_err() {
                return Err(EngineError::NotFound(format!("stored copy for {}", record.original_path.display())));
            }
        }
        Ok(())
    }

    pub fn restore(&self, record: &BackupRecord) -> Result<(), EngineError> {
        self.verify(record)?;
        self.apply(record)
    }

    /// Puts the pre-image back without checking for conflicts.
    pub fn apply(&self, record: &BackupRecord) -> Result<(), EngineError> {
        remove_path(&record.original_path)?;
        if let Some(ref stored) = record.stored_copy_path {
            if let Some(parent) = record.original_path.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_tree(stored, &record.original_path)?;
        }
        info!("Restored {:?}", record.original_path);
        Ok(())
    }

    /// Drops the stored copy and forgets the record.
    pub fn purge(&self, record: &BackupRecord) -> Result<(), EngineError> {
        self.take(&record.backup_id);
        if let Some(ref stored) = record.stored_copy_path {
            remove_path(stored)?;
        }
        Ok(())
    }

    /// Removes the record from the store's tables and returns it. The stored
    /// copy stays on disk until `purge`.
    pub fn take(&self, backup_id: &str) -> Option<BackupRecord> {
        let (_, record) = self.records.remove(backup_id)?;
        let key = (record.operation_id.clone(), record.original_path.clone());
        self.by_operation_path.remove(&key);
        self.save_locks.remove(&key);
        Some(record)
    }

    /// Records no ledger entry references, created before `cutoff`, and not
    /// belonging to an operation still in flight.
    pub fn orphans(&self, referenced: &HashSet<String>, cutoff: DateTime<Utc>) -> Vec<BackupRecord> {
        self.records
            .iter()
            .filter(|r| {
                !referenced.contains(r.key()) && r.created_at < cutoff && !self.pending.contains_key(&r.operation_id)
            })
            .map(|r| r.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes the index. The file is replaced whole so a crash mid-write
    /// leaves the previous index in place.
    pub fn flush(&self) -> Result<(), EngineError> {
        let _held = self.flush_lock.lock().unwrap_or_else(|p| p.into_inner());
        let records: Vec<BackupRecord> = self.records.iter().map(|r| r.clone()).collect();
        let json = serde_json::to_string_pretty(&records)?;
        let partial = self.root.join(format!("{}.partial", INDEX_FILE));
        fs::write(&partial, json)?;
        fs::rename(&partial, self.root.join(INDEX_FILE))?;
        Ok(())
    }
}
