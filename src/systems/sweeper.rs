use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::models::{ActivityLog, UndoLedger};
use crate::systems::backup_store::BackupStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub purged_backups: usize,
    pub orphaned_backups: usize,
    pub pruned_events: usize,
}

/// Releases undo entries whose window has closed, together with their backups,
/// and trims the activity log.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<BackupStore>,
    ledger: Arc<UndoLedger>,
    activity: Arc<ActivityLog>,
    interval: Duration,
}

/// A running sweeper task. Dropping it leaves the task running; call `stop`.
pub struct SweeperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl ExpirySweeper {
    pub fn new(store: Arc<BackupStore>, ledger: Arc<UndoLedger>, activity: Arc<ActivityLog>, interval: Duration) -> Self {
        Self { store, ledger, activity, interval }
    }

    /// Spawns the periodic task on the current tokio runtime.
    pub fn start(self) -> SweeperHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            info!("Expiry sweeper started (interval: {:?})", self.interval);
            let mut interval_timer = time::interval(self.interval);
            interval_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval_timer.tick() => {}
                }

                let sweeper = self.clone();
                match tokio::task::spawn_blocking(move || sweeper.sweep_once(Utc::now())).await {
                    Ok(report) if report != SweepReport::default() => debug!("Sweep: {:?}", report),
                    Ok(_) => {}
                    Err(e) => error!("Sweep panicked: {}", e),
                }
            }
            info!("Expiry sweeper stopped");
        });

        SweeperHandle { token, handle }
    }

    /// One pass over the ledger, the backup store and the activity log. Errors
    /// are logged and the pass carries on.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for operation_id in self.ledger.expired_ids(now) {
            // An undo may have consumed the entry since the scan.
            let Some(entry) = self.ledger.remove_if_expired(&operation_id, now) else {
                debug!("Entry {} already gone", operation_id);
                continue;
            };
            report.expired_entries += 1;

            for backup_id in &entry.backup_ids {
                let Some(record) = self.store.get(backup_id) else {
                    continue;
                };
                match self.store.purge(&record) {
                    Ok(()) => report.purged_backups += 1,
                    Err(e) => warn!("Failed to purge backup {} of {}: {}", backup_id, operation_id, e),
                }
            }
        }

        let referenced = self.ledger.referenced_backups();
        for record in self.store.orphans(&referenced, now - self.ledger.window()) {
            match self.store.purge(&record) {
                Ok(()) => report.orphaned_backups += 1,
                Err(e) => warn!("Failed to purge orphaned backup {}: {}", record.backup_id, e),
            }
        }

        match self.activity.prune_at(now) {
            Ok(n) => report.pruned_events = n,
            Err(e) => warn!("Failed to prune activity log: {}", e),
        }

        if report.expired_entries > 0 || report.orphaned_backups > 0 {
            info!(
                "Released {} expired operations ({} backups, {} orphans)",
                report.expired_entries, report.purged_backups, report.orphaned_backups
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityKind, OperationKind};
    use std::fs;
    use tempfile::tempdir;

    fn sweeper(dir: &std::path::Path, window_ms: i64) -> ExpirySweeper {
        ExpirySweeper::new(
            Arc::new(BackupStore::open(dir.join("backups")).unwrap()),
            Arc::new(UndoLedger::new(chrono::Duration::milliseconds(window_ms))),
            Arc::new(ActivityLog::in_memory(chrono::Duration::days(2))),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn test_expired_entries_release_their_backups() {
        let dir = tempdir().unwrap();
        let s = sweeper(dir.path(), 30_000);
        let file = dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let old = s.store.save("old", &file).unwrap();
        let fresh = s.store.save("fresh", &file).unwrap();
        let start = Utc::now();
        s.ledger.register_at("old", OperationKind::Delete, vec![old.backup_id.clone()], 0, start).unwrap();
        s.ledger
            .register_at("fresh", OperationKind::Delete, vec![fresh.backup_id.clone()], 0, start + chrono::Duration::seconds(20))
            .unwrap();

        let report = s.sweep_once(start + chrono::Duration::seconds(31));
        assert_eq!(report.expired_entries, 1);
        assert_eq!(report.purged_backups, 1);
        assert!(s.ledger.get("old").is_none());
        assert!(s.store.get(&old.backup_id).is_none());
        assert!(!old.stored_copy_path.unwrap().exists());
        assert!(s.store.get(&fresh.backup_id).is_some());
    }

    #[test]
    fn test_consumed_entry_is_left_alone() {
        let dir = tempdir().unwrap();
        let s = sweeper(dir.path(), 30_000);
        let record = s.store.save("op", &dir.path().join("new")).unwrap();
        let start = Utc::now();
        s.ledger.register_at("op", OperationKind::Create, vec![record.backup_id.clone()], 0, start).unwrap();

        // Undo got there first.
        let entry = s.ledger.consume_at("op", start + chrono::Duration::seconds(29)).unwrap();
        let _guard = s.store.begin("op");
        let report = s.sweep_once(start + chrono::Duration::seconds(31));

        assert_eq!(report.expired_entries, 0);
        assert_eq!(report.orphaned_backups, 0);
        assert!(s.store.get(&entry.backup_ids[0]).is_some());
    }

    #[test]
    fn test_orphans_and_old_activity_are_pruned() {
        let dir = tempdir().unwrap();
        let s = sweeper(dir.path(), 1_000);
        s.store.save("crashed", &dir.path().join("x")).unwrap();
        let now = Utc::now();
        s.activity.record_at(&dir.path().join("a.txt"), ActivityKind::Accessed, now - chrono::Duration::days(3)).unwrap();
        s.activity.record_at(&dir.path().join("b.txt"), ActivityKind::Accessed, now).unwrap();

        let report = s.sweep_once(now + chrono::Duration::seconds(5));
        assert_eq!(report.orphaned_backups, 1);
        assert_eq!(report.pruned_events, 1);
        assert!(s.store.is_empty());
        assert_eq!(s.activity.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_task_expires_and_stops() {
        let dir = tempdir().unwrap();
        let s = sweeper(dir.path(), 50);
        let record = s.store.save("op", &dir.path().join("new")).unwrap();
        s.ledger.register("op", OperationKind::Create, vec![record.backup_id], 0).unwrap();

        let store = s.store.clone();
        let ledger = s.ledger.clone();
        let handle = s.start();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(ledger.is_empty());
        assert!(store.is_empty());
        assert!(handle.is_running());
        handle.stop().await;
    }
}
