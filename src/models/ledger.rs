use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EngineError, OperationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub operation_id: String,
    pub operation_kind: OperationKind,
    /// In the order the backups were taken; restored back to front.
    pub backup_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Position of the request in its submitted batch.
    #[serde(default)]
    pub submission: usize,
}

impl UndoEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub entries: HashMap<String, UndoEntry>,
}

/// Time-bounded map from completed operations to the backups that reverse them.
/// Every mutation happens under one short-lived lock; nothing here touches the
/// filesystem except `save`/`load`.
pub struct UndoLedger {
    state: Mutex<LedgerState>,
    window: Duration,
}

impl UndoLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, EngineError> {
        self.state.lock().map_err(|_| EngineError::new("Failed to lock undo ledger"))
    }

    pub fn register(
        &self,
        operation_id: &str,
        kind: OperationKind,
        backup_ids: Vec<String>,
        submission: usize,
    ) -> Result<UndoEntry, EngineError> {
        self.register_at(operation_id, kind, backup_ids, submission, Utc::now())
    }

    pub fn register_at(
        &self,
        operation_id: &str,
        kind: OperationKind,
        backup_ids: Vec<String>,
        submission: usize,
        now: DateTime<Utc>,
    ) -> Result<UndoEntry, EngineError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.entries.get(operation_id) {
            if !existing.is_expired_at(now) {
                return Err(EngineError::DuplicateRegistration(operation_id.to_string()));
            }
            log::debug!("Replacing expired ledger entry {}", operation_id);
        }

        let entry = UndoEntry {
            operation_id: operation_id.to_string(),
            operation_kind: kind,
            backup_ids,
            created_at: now,
            expires_at: now + self.window,
            submission,
        };
        state.entries.insert(operation_id.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn consume(&self, operation_id: &str) -> Result<UndoEntry, EngineError> {
        self.consume_at(operation_id, Utc::now())
    }

    /// Removes the entry. Expired entries are removed too but reported as `Expired`.
    pub fn consume_at(&self, operation_id: &str, now: DateTime<Utc>) -> Result<UndoEntry, EngineError> {
        let mut state = self.lock()?;
        match state.entries.remove(operation_id) {
            Some(entry) if entry.is_expired_at(now) => Err(EngineError::Expired(operation_id.to_string())),
            Some(entry) => Ok(entry),
            None => Err(EngineError::NotFound(operation_id.to_string())),
        }
    }

    pub fn latest(&self) -> Option<String> {
        self.latest_at(Utc::now())
    }

    pub fn latest_at(&self, now: DateTime<Utc>) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .entries
            .values()
            .filter(|e| !e.is_expired_at(now))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.submission.cmp(&b.submission)))
            .map(|e| e.operation_id.clone())
    }

    /// Ids of entries whose window has closed. The caller removes each one
    /// separately with `remove_if_expired`.
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .values()
                    .filter(|e| e.is_expired_at(now))
                    .map(|e| e.operation_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_if_expired(&self, operation_id: &str, now: DateTime<Utc>) -> Option<UndoEntry> {
        let mut state = self.state.lock().ok()?;
        match state.entries.get(operation_id) {
            Some(entry) if entry.is_expired_at(now) => state.entries.remove(operation_id),
            _ => None,
        }
    }

    /// Puts back an entry taken by `consume` whose restore was aborted. Keeps the
    /// original expiry so the window never grows.
    pub fn reinstate(&self, entry: UndoEntry) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        if state.entries.contains_key(&entry.operation_id) {
            return Err(EngineError::DuplicateRegistration(entry.operation_id));
        }
        state.entries.insert(entry.operation_id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, operation_id: &str) -> Option<UndoEntry> {
        self.state.lock().ok()?.entries.get(operation_id).cloned()
    }

    pub fn referenced_backups(&self) -> HashSet<String> {
        self.state
            .lock()
            .map(|s| s.entries.values().flat_map(|e| e.backup_ids.iter().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let state = self.lock()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*state)?;
        let partial = path.with_extension("partial");
        fs::write(&partial, json)?;
        fs::rename(&partial, path)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(path)?;
        match serde_json::from_str::<LedgerState>(&content) {
            Ok(loaded) => {
                let mut state = self.lock()?;
                *state = loaded;
            }
            Err(e) => log::error!("Failed to parse undo ledger {:?}: {}", path, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger() -> UndoLedger {
        UndoLedger::new(Duration::seconds(30))
    }

    #[test]
    fn test_window_is_fixed_for_every_entry() {
        let ledger = ledger();
        let now = Utc::now();
        let a = ledger.register_at("a", OperationKind::Delete, vec!["b1".into()], 0, now).unwrap();
        let b = ledger.register_at("b", OperationKind::Move, vec![], 1, now + Duration::seconds(3)).unwrap();
        assert_eq!(a.expires_at - a.created_at, Duration::seconds(30));
        assert_eq!(b.expires_at - b.created_at, Duration::seconds(30));
    }

    #[test]
    fn test_duplicate_active_registration_is_rejected() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.register_at("op", OperationKind::Create, vec![], 0, now).unwrap();
        let err = ledger.register_at("op", OperationKind::Create, vec![], 0, now).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration(_)));

        // Once the first entry has expired the id can be reused.
        assert!(ledger.register_at("op", OperationKind::Create, vec![], 0, now + Duration::seconds(31)).is_ok());
    }

    #[test]
    fn test_consume_found_expired_and_missing() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.register_at("live", OperationKind::Delete, vec!["x".into()], 0, now).unwrap();
        ledger.register_at("stale", OperationKind::Delete, vec!["y".into()], 0, now - Duration::seconds(60)).unwrap();

        let entry = ledger.consume_at("live", now).unwrap();
        assert_eq!(entry.backup_ids, vec!["x".to_string()]);
        assert!(matches!(ledger.consume_at("live", now), Err(EngineError::NotFound(_))));

        assert!(matches!(ledger.consume_at("stale", now), Err(EngineError::Expired(_))));
        // Lazily removed on access.
        assert!(ledger.get("stale").is_none());
    }

    #[test]
    fn test_latest_breaks_ties_by_submission_order() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.register_at("first", OperationKind::Create, vec![], 0, now).unwrap();
        ledger.register_at("third", OperationKind::Create, vec![], 2, now).unwrap();
        ledger.register_at("second", OperationKind::Create, vec![], 1, now).unwrap();
        assert_eq!(ledger.latest_at(now).as_deref(), Some("third"));

        ledger.register_at("newest", OperationKind::Create, vec![], 0, now + Duration::milliseconds(1)).unwrap();
        assert_eq!(ledger.latest_at(now + Duration::milliseconds(1)).as_deref(), Some("newest"));
    }

    #[test]
    fn test_latest_skips_expired_entries() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.register_at("old", OperationKind::Create, vec![], 0, now - Duration::seconds(45)).unwrap();
        assert_eq!(ledger.latest_at(now), None);
    }

    #[test]
    fn test_remove_if_expired_only_takes_expired() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.register_at("live", OperationKind::Rename, vec![], 0, now).unwrap();
        ledger.register_at("stale", OperationKind::Rename, vec![], 0, now - Duration::seconds(30)).unwrap();

        assert_eq!(ledger.expired_ids(now), vec!["stale".to_string()]);
        assert!(ledger.remove_if_expired("live", now).is_none());
        assert!(ledger.remove_if_expired("stale", now).is_some());
        assert!(ledger.remove_if_expired("stale", now).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_save_and_load_round_trip_keeps_expiry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("undo_ledger.json");
        let now = Utc::now();

        let ledger = ledger();
        let entry = ledger.register_at("op", OperationKind::Copy, vec!["b".into()], 3, now).unwrap();
        ledger.save(&path).unwrap();

        let loaded = UndoLedger::new(Duration::seconds(30));
        loaded.load(&path).unwrap();
        assert_eq!(loaded.get("op"), Some(entry));
    }
}
