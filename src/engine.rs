use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde::Serialize;

use crate::commands::interpreter::{Command, CommandOutcome, CommandRecord, Interpreter};
use crate::models::{
    ActivityKind, ActivityLog, BackupRecord, EngineConfig, EngineError, OperationKind, OperationRequest,
    OperationResult, UndoEntry, UndoLedger,
};
use crate::systems::activity_watcher::ActivityWatcher;
use crate::systems::backup_store::BackupStore;
use crate::systems::file_ops::FileOps;
use crate::systems::scheduler::Scheduler;
use crate::systems::sweeper::{ExpirySweeper, SweeperHandle};
use crate::systems::trash::{DirectoryTrash, SystemTrash, TrashFacility};
use crate::utils::path_security::safe_join;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UndoOutcome {
    Restored {
        operation_id: String,
        operation_kind: OperationKind,
        /// Paths put back, in the order they were restored.
        restored: Vec<PathBuf>,
    },
    NothingToUndo {
        reason: String,
    },
}

/// The engine a host opens once per managed folder. Owns the backup store,
/// undo ledger and activity log, and the tasks that run against them.
pub struct Engine {
    config: EngineConfig,
    root: PathBuf,
    store: Arc<BackupStore>,
    ledger: Arc<UndoLedger>,
    activity: Arc<ActivityLog>,
    scheduler: Scheduler,
    interpreter: Interpreter,
    sweeper: Mutex<Option<SweeperHandle>>,
    watcher: Mutex<Option<ActivityWatcher>>,
}

impl Engine {
    /// Opens the engine with the trash configured in `config`: a plain
    /// directory when `trash_dir` is set, the platform trash otherwise.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let trash: Arc<dyn TrashFacility> = match config.trash_dir {
            Some(ref dir) => Arc::new(DirectoryTrash::new(dir.clone())?),
            None => Arc::new(SystemTrash),
        };
        Self::open_with_trash(config, trash)
    }

    pub fn open_with_trash(config: EngineConfig, trash: Arc<dyn TrashFacility>) -> Result<Self, EngineError> {
        let root = fs::canonicalize(config.resolve_target_root()?)?;
        fs::create_dir_all(&config.state_dir)?;

        let store = Arc::new(BackupStore::open(config.backups_dir())?);
        let ledger = Arc::new(UndoLedger::new(config.undo_window()));
        ledger.load(&config.ledger_path())?;
        let activity = Arc::new(ActivityLog::open(
            &config.activity_log_path(),
            config.activity_retention(),
            config.activity_ignore_patterns.clone(),
        )?);

        let ops = FileOps::new(
            root.clone(),
            store.clone(),
            ledger.clone(),
            activity.clone(),
            trash,
            config.protect_hidden,
        );

        let watcher = if config.watch_activity {
            match ActivityWatcher::start(root.clone(), activity.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("Activity watcher disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Engine open on {:?} ({} pending undo entries, {} backups)",
            root,
            ledger.len(),
            store.len()
        );

        Ok(Self {
            interpreter: Interpreter::new(root.clone()),
            scheduler: Scheduler::new(Arc::new(ops)),
            config,
            root,
            store,
            ledger,
            activity,
            sweeper: Mutex::new(None),
            watcher: Mutex::new(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &UndoLedger {
        &self.ledger
    }

    pub fn backups(&self) -> &BackupStore {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Starts the expiry sweeper on the current tokio runtime. A second call
    /// is a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }
        let sweeper = ExpirySweeper::new(
            self.store.clone(),
            self.ledger.clone(),
            self.activity.clone(),
            self.config.sweep_interval(),
        );
        *slot = Some(sweeper.start());
    }

    /// Stops background work and writes the ledger and backup index to disk.
    pub async fn close(&self) -> Result<(), EngineError> {
        let handle = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.watcher.lock().unwrap_or_else(|p| p.into_inner()).take();

        self.ledger.save(&self.config.ledger_path())?;
        self.store.flush()?;
        info!("Engine closed ({} undo entries kept)", self.ledger.len());
        Ok(())
    }

    /// Runs a batch. Results come back in request order.
    pub async fn execute(&self, requests: Vec<OperationRequest>) -> Vec<OperationResult> {
        let results = self.scheduler.run(requests).await;
        self.persist();
        results
    }

    /// Writes the ledger and backup index after a batch or undo, so a crash
    /// loses at most the work in flight.
    fn persist(&self) {
        if let Err(e) = self.ledger.save(&self.config.ledger_path()) {
            warn!("Could not save undo ledger: {}", e);
        }
        if let Err(e) = self.store.flush() {
            warn!("Could not write backup index: {}", e);
        }
    }

    /// Interprets and runs command records. Consecutive records are scheduled
    /// as one batch so later ones see earlier ones' conflicts; an undo record
    /// waits for everything before it.
    pub async fn submit(&self, records: Vec<CommandRecord>) -> Vec<CommandOutcome> {
        let mut outcomes: Vec<Option<CommandOutcome>> = vec![None; records.len()];
        let mut pending: Vec<(usize, usize)> = Vec::new();
        let mut batch: Vec<OperationRequest> = Vec::new();

        for (index, record) in records.iter().enumerate() {
            match self.interpreter.parse(record) {
                Ok(Command::Run(requests)) => {
                    pending.push((index, requests.len()));
                    batch.extend(requests);
                }
                Ok(Command::UndoLast) => {
                    self.flush_batch(&records, &mut outcomes, &mut pending, &mut batch).await;
                    outcomes[index] = Some(self.undo_outcome(&record.operation_name).await);
                }
                Err(e) => outcomes[index] = Some(CommandOutcome::rejected(&record.operation_name, e)),
            }
        }
        self.flush_batch(&records, &mut outcomes, &mut pending, &mut batch).await;
        self.persist();

        outcomes.into_iter().flatten().collect()
    }

    async fn flush_batch(
        &self,
        records: &[CommandRecord],
        outcomes: &mut [Option<CommandOutcome>],
        pending: &mut Vec<(usize, usize)>,
        batch: &mut Vec<OperationRequest>,
    ) {
        let mut results = self.scheduler.run(std::mem::take(batch)).await.into_iter();
        for (index, count) in pending.drain(..) {
            let mine: Vec<OperationResult> = results.by_ref().take(count).collect();
            outcomes[index] = Some(CommandOutcome::from_results(&records[index].operation_name, mine));
        }
    }

    async fn undo_outcome(&self, operation_name: &str) -> CommandOutcome {
        match self.undo_last().await {
            Ok(UndoOutcome::Restored { operation_id, restored, .. }) => CommandOutcome {
                message: Some(format!("Undid {} ({} paths restored)", operation_id, restored.len())),
                ..CommandOutcome::from_results(operation_name, Vec::new())
            },
            Ok(UndoOutcome::NothingToUndo { reason }) => CommandOutcome {
                message: Some(reason),
                ..CommandOutcome::from_results(operation_name, Vec::new())
            },
            Err(e) => CommandOutcome::rejected(operation_name, e),
        }
    }

    /// Reverses the most recent operation still inside its undo window.
    pub async fn undo_last(&self) -> Result<UndoOutcome, EngineError> {
        match self.ledger.latest() {
            Some(operation_id) => self.undo(&operation_id).await,
            None => Ok(UndoOutcome::NothingToUndo { reason: "Nothing to undo".to_string() }),
        }
    }

    /// Reverses one operation. Every backup is checked before anything is
    /// restored; on `RestoreConflict` nothing changes and the entry stays
    /// undoable until it expires.
    pub async fn undo(&self, operation_id: &str) -> Result<UndoOutcome, EngineError> {
        let store = self.store.clone();
        let ledger = self.ledger.clone();
        let activity = self.activity.clone();
        let operation_id = operation_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || revert(&store, &ledger, &activity, &operation_id))
            .await
            .map_err(|e| EngineError::new(format!("Undo task failed: {}", e)))?;
        self.persist();
        outcome
    }

    /// Notes that the user opened or read an item. Relative paths resolve
    /// under the managed folder.
    pub fn record_access(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = safe_join(&self.root, &path.as_ref().to_string_lossy())?;
        self.activity.record(&path, ActivityKind::Accessed)
    }
}

fn revert(
    store: &BackupStore,
    ledger: &UndoLedger,
    activity: &ActivityLog,
    operation_id: &str,
) -> Result<UndoOutcome, EngineError> {
    let entry = match ledger.consume(operation_id) {
        Ok(entry) => entry,
        Err(e) if e.is_benign() => {
            info!("Nothing to undo for {}: {}", operation_id, e);
            return Ok(UndoOutcome::NothingToUndo { reason: e.to_string() });
        }
        Err(e) => return Err(e),
    };
    let _pending = store.begin(operation_id);

    let mut records = Vec::with_capacity(entry.backup_ids.len());
    for backup_id in &entry.backup_ids {
        match store.get(backup_id) {
            Some(record) => records.push(record),
            None => {
                error!("Backup {} of {} is missing", backup_id, operation_id);
                let err = EngineError::new(format!("Backup {} is missing", backup_id));
                if let Err(e) = ledger.reinstate(entry) {
                    warn!("Could not reinstate {}: {}", operation_id, e);
                }
                return Err(err);
            }
        }
    }

    if let Some(err) = records.iter().find_map(|r| store.verify(r).err()) {
        warn!("Undo of {} aborted: {}", operation_id, err);
        if let Err(e) = ledger.reinstate(entry) {
            warn!("Could not reinstate {}: {}", operation_id, e);
        }
        return Err(err);
    }

    let mut restored = Vec::with_capacity(records.len());
    for (position, record) in records.iter().enumerate().rev() {
        if let Err(e) = store.apply(record) {
            error!("Undo of {} stopped at {:?}: {}", operation_id, record.original_path, e);
            return Err(keep_unrestored(store, ledger, entry, &records, position, &restored, e));
        }
        let kind = if record.is_absence_marker() { ActivityKind::Deleted } else { ActivityKind::Created };
        if let Err(e) = activity.record(&record.original_path, kind) {
            warn!("Could not record activity for {:?}: {}", record.original_path, e);
        }
        restored.push(record.original_path.clone());
    }

    for record in &records {
        if let Err(e) = store.purge(record) {
            warn!("Could not purge backup {}: {}", record.backup_id, e);
        }
    }

    info!("Undid {} {} ({} paths)", entry.operation_kind, operation_id, restored.len());
    Ok(UndoOutcome::Restored {
        operation_id: operation_id.to_string(),
        operation_kind: entry.operation_kind,
        restored,
    })
}

/// Handles a restore that failed part way. Paths already put back keep their
/// new state and lose their backups; the failed record and everything before
/// it stay undoable under the same entry and deadline.
fn keep_unrestored(
    store: &BackupStore,
    ledger: &UndoLedger,
    mut entry: UndoEntry,
    records: &[BackupRecord],
    failed: usize,
    restored: &[PathBuf],
    err: EngineError,
) -> EngineError {
    // `apply` may have removed or half-copied the path before failing.
    if let Err(e) = store.seal(&records[failed].backup_id) {
        warn!("Could not reseal backup {}: {}", records[failed].backup_id, e);
    }
    for record in &records[failed + 1..] {
        if let Err(e) = store.purge(record) {
            warn!("Could not purge backup {}: {}", record.backup_id, e);
        }
    }

    entry.backup_ids = records[..=failed].iter().map(|r| r.backup_id.clone()).collect();
    if let Err(e) = ledger.reinstate(entry) {
        warn!("Could not reinstate partial undo: {}", e);
    }

    if restored.is_empty() {
        return err;
    }
    let paths: Vec<String> = restored.iter().map(|p| p.display().to_string()).collect();
    err.with_context(format!("already restored: {}", paths.join(", ")))
}
