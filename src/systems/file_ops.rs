use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::models::{
    ActivityKind, ActivityLog, BackupRecord, CollisionPolicy, EngineError, EntryType, OperationKind,
    OperationRequest, OperationResult, UndoLedger,
};
use crate::systems::backup_store::BackupStore;
use crate::systems::trash::TrashFacility;
use crate::utils::path_security::{is_ancestor_or_equal, normalize, validate_file_name};
use crate::utils::{copy_tree, is_hidden, move_path, remove_path, unique_destination_with};

#[derive(Debug, Clone, PartialEq)]
enum Action {
    CreateDir { path: PathBuf, replace: bool },
    WriteFile { path: PathBuf, content: String, replace: bool },
    Relocate { from: PathBuf, to: PathBuf, replace: bool },
    Duplicate { from: PathBuf, to: PathBuf, replace: bool },
    Trash { path: PathBuf },
}

impl Action {
    fn apply(&self, trash: &dyn TrashFacility) -> Result<(), EngineError> {
        match self {
            Action::CreateDir { path, replace } => {
                if *replace {
                    remove_path(path)?;
                }
                fs::create_dir_all(path)?;
            }
            Action::WriteFile { path, content, replace } => {
                if *replace {
                    remove_path(path)?;
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, content)?;
            }
            Action::Relocate { from, to, replace } => {
                if *replace {
                    remove_path(to)?;
                }
                move_path(from, to)?;
            }
            Action::Duplicate { from, to, replace } => {
                if *replace {
                    remove_path(to)?;
                }
                copy_tree(from, to)?;
            }
            Action::Trash { path } => trash.send_to_trash(path)?,
        }
        Ok(())
    }

    fn affected(&self) -> &Path {
        match self {
            Action::CreateDir { path, .. } | Action::WriteFile { path, .. } | Action::Trash { path } => path,
            Action::Relocate { to, .. } | Action::Duplicate { to, .. } => to,
        }
    }

    fn activity(&self) -> Vec<(&Path, ActivityKind)> {
        match self {
            Action::CreateDir { path, .. } | Action::WriteFile { path, .. } => vec![(path, ActivityKind::Created)],
            Action::Relocate { to, .. } => vec![(to, ActivityKind::Moved)],
            Action::Duplicate { from, to, .. } => vec![(from, ActivityKind::Accessed), (to, ActivityKind::Created)],
            Action::Trash { path } => vec![(path, ActivityKind::Deleted)],
        }
    }
}

/// One unit of mutation plus every path it changes.
#[derive(Debug)]
struct Step {
    backup_paths: Vec<PathBuf>,
    action: Action,
}

/// The Create/Move/Copy/Rename/Delete handlers. Each request goes through
/// validate, back up every path it will touch, mutate, then register undo.
pub struct FileOps {
    root: PathBuf,
    store: Arc<BackupStore>,
    ledger: Arc<UndoLedger>,
    activity: Arc<ActivityLog>,
    trash: Arc<dyn TrashFacility>,
    protect_hidden: bool,
}

impl FileOps {
    pub fn new(
        root: PathBuf,
        store: Arc<BackupStore>,
        ledger: Arc<UndoLedger>,
        activity: Arc<ActivityLog>,
        trash: Arc<dyn TrashFacility>,
        protect_hidden: bool,
    ) -> Self {
        Self { root, store, ledger, activity, trash, protect_hidden }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs one request to completion. Never panics on filesystem errors; every
    /// failure ends up in the returned result.
    pub fn execute(&self, request: &OperationRequest, submission: usize) -> OperationResult {
        // `..` is collapsed before any containment check sees the path.
        let request = &Self::normalized(request);
        info!("Executing {} {} on {:?}", request.kind, request.id, request.targets);
        let _pending = self.store.begin(&request.id);

        let steps = match self.plan(request) {
            Ok(steps) => steps,
            Err(e) => {
                warn!("Rejected {} {}: {}", request.kind, request.id, e);
                return OperationResult::failed(request, Vec::new(), e);
            }
        };

        let mut step_backups: Vec<Vec<BackupRecord>> = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut records = Vec::with_capacity(step.backup_paths.len());
            for path in &step.backup_paths {
                match self.store.save(&request.id, path) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!("Backup of {:?} failed for {}: {}", path, request.id, e);
                        self.discard(step_backups.iter().flatten().chain(records.iter()));
                        return OperationResult::failed(request, Vec::new(), e);
                    }
                }
            }
            step_backups.push(records);
        }

        let mut completed = 0;
        let mut failure = None;
        for step in &steps {
            match step.action.apply(self.trash.as_ref()) {
                Ok(()) => completed += 1,
                Err(e) => {
                    warn!("{} {} failed on {:?}: {}", request.kind, request.id, step.action.affected(), e);
                    failure = Some(e);
                    break;
                }
            }
        }

        // Backups for steps that never ran have nothing to undo.
        self.discard(step_backups[completed..].iter().flatten());

        let kept: Vec<&BackupRecord> = step_backups[..completed].iter().flatten().collect();
        for record in &kept {
            if let Err(e) = self.store.seal(&record.backup_id) {
                warn!("Could not seal backup {}: {}", record.backup_id, e);
            }
        }

        let done = &steps[..completed];
        for step in done {
            for (path, kind) in step.action.activity() {
                if let Err(e) = self.activity.record(path, kind) {
                    warn!("Could not record activity for {:?}: {}", path, e);
                }
            }
        }

        if completed > 0 {
            let backup_ids = kept.iter().map(|r| r.backup_id.clone()).collect();
            match self.ledger.register(&request.id, request.kind, backup_ids, submission) {
                Ok(entry) => debug!("Undo for {} available until {}", request.id, entry.expires_at),
                Err(e) => {
                    warn!("Could not register undo for {}: {}", request.id, e);
                    self.discard(kept.iter().copied());
                }
            }
        }

        let affected = done.iter().map(|s| s.action.affected().to_path_buf()).collect();
        match failure {
            None => OperationResult::succeeded(request, affected),
            Some(e) => OperationResult::failed(request, affected, e),
        }
    }

    fn normalized(request: &OperationRequest) -> OperationRequest {
        let mut request = request.clone();
        request.targets = request.targets.iter().map(|p| normalize(p)).collect();
        request.destination = request.destination.as_deref().map(normalize);
        request
    }

    fn discard<'a>(&self, records: impl Iterator<Item = &'a BackupRecord>) {
        for record in records {
            if let Err(e) = self.store.purge(record) {
                warn!("Could not purge backup {}: {}", record.backup_id, e);
            }
        }
    }

    fn plan(&self, request: &OperationRequest) -> Result<Vec<Step>, EngineError> {
        match request.kind {
            OperationKind::Create => self.plan_create(request),
            OperationKind::Move => self.plan_transfer(request, true),
            OperationKind::Copy => self.plan_transfer(request, false),
            OperationKind::Rename => self.plan_rename(request),
            OperationKind::Delete => self.plan_delete(request),
        }
    }

    fn check_inside_root(&self, path: &Path) -> Result<(), EngineError> {
        if !path.starts_with(&self.root) {
            return Err(EngineError::validation(format!("Path is outside the managed folder: {}", path.display())));
        }
        if path == self.root {
            return Err(EngineError::validation("The managed folder itself cannot be changed"));
        }
        Ok(())
    }

    fn check_exists(path: &Path) -> Result<(), EngineError> {
        if fs::symlink_metadata(path).is_err() {
            return Err(EngineError::validation(format!("Item does not exist: {}", path.display())));
        }
        Ok(())
    }

    fn check_visible(&self, path: &Path) -> Result<(), EngineError> {
        if self.protect_hidden && is_hidden(path) {
            return Err(EngineError::validation(format!("Refusing to touch hidden file: {}", path.display())));
        }
        Ok(())
    }

    fn single_target(request: &OperationRequest) -> Result<&PathBuf, EngineError> {
        match request.targets.as_slice() {
            [one] => Ok(one),
            [] => Err(EngineError::validation(format!("{} needs a target", request.kind))),
            _ => Err(EngineError::validation(format!("{} takes exactly one target", request.kind))),
        }
    }

    /// Applies the collision policy to `candidate`. `planned` holds landing
    /// paths already claimed by earlier items of the same request.
    fn resolve_landing(
        candidate: PathBuf,
        policy: CollisionPolicy,
        planned: &mut HashSet<PathBuf>,
    ) -> Result<(PathBuf, bool), EngineError> {
        let taken = fs::symlink_metadata(&candidate).is_ok() || planned.contains(&candidate);
        let resolved = if !taken {
            (candidate, false)
        } else {
            match policy {
                CollisionPolicy::Suffix => (unique_destination_with(&candidate, |p| planned.contains(p)), false),
                CollisionPolicy::Overwrite if !planned.contains(&candidate) => (candidate, true),
                CollisionPolicy::Overwrite => {
                    return Err(EngineError::validation(format!(
                        "Two items would land at {}",
                        candidate.display()
                    )))
                }
                CollisionPolicy::Fail => {
                    return Err(EngineError::validation(format!("Already exists: {}", candidate.display())))
                }
            }
        };
        planned.insert(resolved.0.clone());
        Ok(resolved)
    }

    fn plan_create(&self, request: &OperationRequest) -> Result<Vec<Step>, EngineError> {
        let target = Self::single_target(request)?;
        self.check_inside_root(target)?;
        if let Some(name) = target.file_name() {
            validate_file_name(&name.to_string_lossy())?;
        }

        let mut planned = HashSet::new();
        let (path, replace) = Self::resolve_landing(target.clone(), request.params.collision, &mut planned)?;

        // Undo removes the topmost directory this create brings into existence.
        let mut top = path.clone();
        while let Some(parent) = top.parent() {
            if parent == self.root || fs::symlink_metadata(parent).is_ok() {
                if !parent.is_dir() {
                    return Err(EngineError::validation(format!("Not a directory: {}", parent.display())));
                }
                break;
            }
            top = parent.to_path_buf();
        }

        let action = match request.params.entry {
            EntryType::Directory => Action::CreateDir { path, replace },
            EntryType::File => Action::WriteFile {
                path,
                content: request.params.content.clone().unwrap_or_default(),
                replace,
            },
        };
        Ok(vec![Step { backup_paths: vec![top], action }])
    }

    fn plan_transfer(&self, request: &OperationRequest, is_move: bool) -> Result<Vec<Step>, EngineError> {
        let dest = request
            .destination
            .as_ref()
            .ok_or_else(|| EngineError::validation(format!("No destination provided for {}", request.kind)))?;
        if !dest.starts_with(&self.root) {
            return Err(EngineError::validation(format!("Path is outside the managed folder: {}", dest.display())));
        }
        if !dest.is_dir() {
            return Err(EngineError::validation(format!("Destination folder does not exist: {}", dest.display())));
        }
        if request.targets.is_empty() {
            return Err(EngineError::validation(format!("{} needs at least one item", request.kind)));
        }

        let mut planned = HashSet::new();
        let mut steps = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            self.check_inside_root(target)?;
            Self::check_exists(target)?;
            self.check_visible(target)?;
            if is_ancestor_or_equal(target, dest) {
                return Err(EngineError::validation(format!(
                    "Cannot {} {} into itself",
                    request.kind,
                    target.display()
                )));
            }

            let name = target
                .file_name()
                .ok_or_else(|| EngineError::validation(format!("Invalid source name: {}", target.display())))?;
            let candidate = dest.join(name);
            if is_move && candidate == *target {
                return Err(EngineError::validation(format!("{} is already in {}", target.display(), dest.display())));
            }

            let (landing, replace) = Self::resolve_landing(candidate, request.params.collision, &mut planned)?;
            let step = if is_move {
                Step {
                    backup_paths: vec![target.clone(), landing.clone()],
                    action: Action::Relocate { from: target.clone(), to: landing, replace },
                }
            } else {
                Step {
                    backup_paths: vec![landing.clone()],
                    action: Action::Duplicate { from: target.clone(), to: landing, replace },
                }
            };
            steps.push(step);
        }
        Ok(steps)
    }

    fn plan_rename(&self, request: &OperationRequest) -> Result<Vec<Step>, EngineError> {
        let target = Self::single_target(request)?;
        let new_path = request
            .destination
            .as_ref()
            .ok_or_else(|| EngineError::validation("No new name provided for rename"))?;

        self.check_inside_root(target)?;
        self.check_inside_root(new_path)?;
        Self::check_exists(target)?;
        self.check_visible(target)?;
        let new_name = new_path
            .file_name()
            .ok_or_else(|| EngineError::validation(format!("Invalid new name: {}", new_path.display())))?;
        validate_file_name(&new_name.to_string_lossy())?;
        if new_path == target {
            return Err(EngineError::validation(format!("{} already has that name", target.display())));
        }
        match new_path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => {
                return Err(EngineError::validation(format!(
                    "Folder for the new name does not exist: {}",
                    new_path.display()
                )))
            }
        }

        let mut planned = HashSet::new();
        let (landing, replace) = Self::resolve_landing(new_path.clone(), request.params.collision, &mut planned)?;
        Ok(vec![Step {
            backup_paths: vec![target.clone(), landing.clone()],
            action: Action::Relocate { from: target.clone(), to: landing, replace },
        }])
    }

    fn plan_delete(&self, request: &OperationRequest) -> Result<Vec<Step>, EngineError> {
        if request.targets.is_empty() {
            return Err(EngineError::validation("delete needs at least one item"));
        }

        let mut seen: Vec<&PathBuf> = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            self.check_inside_root(target)?;
            Self::check_exists(target)?;
            if seen.iter().any(|s| *s == target) {
                continue;
            }
            if seen.iter().any(|s| s.starts_with(target) || target.starts_with(s)) {
                return Err(EngineError::validation(format!("Overlapping delete targets: {}", target.display())));
            }
            seen.push(target);
        }

        Ok(seen
            .into_iter()
            .map(|target| Step {
                backup_paths: vec![target.clone()],
                action: Action::Trash { path: target.clone() },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use crate::systems::trash::DirectoryTrash;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        bin: PathBuf,
        store: Arc<BackupStore>,
        ledger: Arc<UndoLedger>,
        activity: Arc<ActivityLog>,
        ops: FileOps,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Desktop");
        fs::create_dir_all(&root).unwrap();
        let bin = dir.path().join("bin");
        let store = Arc::new(BackupStore::open(dir.path().join("state").join("backups")).unwrap());
        let ledger = Arc::new(UndoLedger::new(chrono::Duration::seconds(30)));
        let activity = Arc::new(ActivityLog::in_memory(chrono::Duration::days(2)));
        let trash: Arc<dyn TrashFacility> = Arc::new(DirectoryTrash::new(&bin).unwrap());
        let ops = FileOps::new(root.clone(), store.clone(), ledger.clone(), activity.clone(), trash, true);
        Fixture { _dir: dir, root, bin, store, ledger, activity, ops }
    }

    #[test]
    fn test_create_dir_registers_absence_backup() {
        let f = fixture();
        let req = OperationRequest::create_dir(f.root.join("work"));
        let result = f.ops.execute(&req, 0);

        assert!(result.success, "{:?}", result.error);
        assert!(f.root.join("work").is_dir());
        let entry = f.ledger.get(&req.id).unwrap();
        assert_eq!(entry.backup_ids.len(), 1);
        let record = f.store.get(&entry.backup_ids[0]).unwrap();
        assert!(record.is_absence_marker());
        assert!(record.sealed.is_some());
        assert_eq!(f.activity.summary(1).created, 1);
    }

    #[test]
    fn test_create_suffixes_on_collision_and_fail_policy_rejects() {
        let f = fixture();
        fs::create_dir(f.root.join("work")).unwrap();

        let result = f.ops.execute(&OperationRequest::create_dir(f.root.join("work")), 0);
        assert_eq!(result.affected, vec![f.root.join("work (1)")]);

        let strict = OperationRequest::create_dir(f.root.join("work")).with_collision(CollisionPolicy::Fail);
        let result = f.ops.execute(&strict, 1);
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::Validation);
        assert!(f.ledger.get(&strict.id).is_none());
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn test_create_nested_backs_up_topmost_new_folder() {
        let f = fixture();
        let req = OperationRequest::create_file(f.root.join("a").join("b").join("notes.txt"), Some("hi".into()));
        let result = f.ops.execute(&req, 0);
        assert!(result.success);

        let entry = f.ledger.get(&req.id).unwrap();
        let record = f.store.get(&entry.backup_ids[0]).unwrap();
        assert_eq!(record.original_path, f.root.join("a"));
        assert_eq!(fs::read_to_string(f.root.join("a/b/notes.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_move_backs_up_source_then_landing() {
        let f = fixture();
        fs::create_dir(f.root.join("work")).unwrap();
        fs::write(f.root.join("a.txt"), "alpha").unwrap();

        let req = OperationRequest::move_to(vec![f.root.join("a.txt")], f.root.join("work"));
        let result = f.ops.execute(&req, 0);
        assert!(result.success, "{:?}", result.error);
        assert!(!f.root.join("a.txt").exists());
        assert_eq!(fs::read_to_string(f.root.join("work/a.txt")).unwrap(), "alpha");

        let entry = f.ledger.get(&req.id).unwrap();
        let first = f.store.get(&entry.backup_ids[0]).unwrap();
        let second = f.store.get(&entry.backup_ids[1]).unwrap();
        assert_eq!(first.original_path, f.root.join("a.txt"));
        assert!(!first.is_absence_marker());
        assert_eq!(second.original_path, f.root.join("work/a.txt"));
        assert!(second.is_absence_marker());
    }

    #[test]
    fn test_move_into_missing_destination_fails_without_backups() {
        let f = fixture();
        fs::write(f.root.join("a.txt"), "alpha").unwrap();
        let req = OperationRequest::move_to(vec![f.root.join("a.txt")], f.root.join("nowhere"));
        let result = f.ops.execute(&req, 0);

        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::Validation);
        assert!(f.store.is_empty());
        assert!(f.root.join("a.txt").exists());
    }

    #[test]
    fn test_move_folder_into_itself_is_rejected() {
        let f = fixture();
        fs::create_dir_all(f.root.join("work/inner")).unwrap();
        let req = OperationRequest::move_to(vec![f.root.join("work")], f.root.join("work/inner"));
        assert!(!f.ops.execute(&req, 0).success);
    }

    #[test]
    fn test_copy_two_same_named_items_get_distinct_landings() {
        let f = fixture();
        fs::create_dir_all(f.root.join("x")).unwrap();
        fs::create_dir_all(f.root.join("y")).unwrap();
        fs::create_dir_all(f.root.join("out")).unwrap();
        fs::write(f.root.join("x/report.txt"), "from x").unwrap();
        fs::write(f.root.join("y/report.txt"), "from y").unwrap();

        let req = OperationRequest::copy_to(vec![f.root.join("x/report.txt"), f.root.join("y/report.txt")], f.root.join("out"));
        let result = f.ops.execute(&req, 0);
        assert!(result.success);
        assert_eq!(fs::read_to_string(f.root.join("out/report.txt")).unwrap(), "from x");
        assert_eq!(fs::read_to_string(f.root.join("out/report (1).txt")).unwrap(), "from y");
        assert!(f.root.join("x/report.txt").exists());
    }

    #[test]
    fn test_hidden_items_are_protected() {
        let f = fixture();
        fs::write(f.root.join(".env"), "SECRET=1").unwrap();
        let req = OperationRequest::rename(f.root.join(".env"), f.root.join("env.txt"));
        let result = f.ops.execute(&req, 0);
        assert!(!result.success);
        assert!(result.error.unwrap().message().contains("hidden"));
    }

    #[test]
    fn test_rename_with_fail_policy() {
        let f = fixture();
        fs::write(f.root.join("a.txt"), "a").unwrap();
        fs::write(f.root.join("b.txt"), "b").unwrap();
        let req = OperationRequest::rename(f.root.join("a.txt"), f.root.join("b.txt")).with_collision(CollisionPolicy::Fail);
        assert!(!f.ops.execute(&req, 0).success);

        let req = OperationRequest::rename(f.root.join("a.txt"), f.root.join("c.txt"));
        let result = f.ops.execute(&req, 1);
        assert!(result.success);
        assert_eq!(result.affected, vec![f.root.join("c.txt")]);
    }

    #[test]
    fn test_delete_is_soft_and_backed_up() {
        let f = fixture();
        fs::write(f.root.join("temp.txt"), "keep me").unwrap();
        let req = OperationRequest::delete(vec![f.root.join("temp.txt")]);
        let result = f.ops.execute(&req, 0);

        assert!(result.success);
        assert!(!f.root.join("temp.txt").exists());
        assert_eq!(fs::read_to_string(f.bin.join("temp.txt")).unwrap(), "keep me");

        let entry = f.ledger.get(&req.id).unwrap();
        let record = f.store.get(&entry.backup_ids[0]).unwrap();
        assert_eq!(fs::read_to_string(record.stored_copy_path.unwrap()).unwrap(), "keep me");
        assert_eq!(f.activity.summary(1).deleted, 1);
    }

    #[test]
    fn test_delete_missing_item_is_validation_error() {
        let f = fixture();
        let req = OperationRequest::delete(vec![f.root.join("ghost.txt")]);
        let result = f.ops.execute(&req, 0);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_paths_outside_root_are_rejected() {
        let f = fixture();
        let outside = f.root.parent().unwrap().join("elsewhere.txt");
        fs::write(&outside, "x").unwrap();
        let result = f.ops.execute(&OperationRequest::delete(vec![outside.clone()]), 0);
        assert!(!result.success);
        assert!(outside.exists());
    }

    #[test]
    fn test_parent_components_cannot_escape_root() {
        let f = fixture();
        let victim = f.root.parent().unwrap().join("victim.txt");
        fs::write(&victim, "mine").unwrap();
        fs::write(f.root.join("a.txt"), "a").unwrap();

        let result = f.ops.execute(&OperationRequest::delete(vec![f.root.join("../victim.txt")]), 0);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::Validation);
        assert!(victim.exists());

        let result = f.ops.execute(&OperationRequest::move_to(vec![f.root.join("a.txt")], f.root.join("..")), 1);
        assert!(!result.success);
        assert!(f.root.join("a.txt").exists());

        let result = f.ops.execute(&OperationRequest::rename(f.root.join("a.txt"), f.root.join("../victim.txt")), 2);
        assert!(!result.success);
        assert_eq!(fs::read_to_string(&victim).unwrap(), "mine");

        // Inner `..` that stays inside the folder is fine.
        let result = f.ops.execute(&OperationRequest::delete(vec![f.root.join("sub/../a.txt")]), 3);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.affected, vec![f.root.join("a.txt")]);
    }
}
