use std::path::PathBuf;
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::models::{ActivityKind, ActivityLog, EngineError};

/// Records changes made to the managed folder by other programs.
pub struct ActivityWatcher {
    // Dropping the watcher stops it.
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl ActivityWatcher {
    pub fn start(root: PathBuf, activity: Arc<ActivityLog>) -> Result<Self, EngineError> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for (path, kind) in classify(&event) {
                        if let Err(e) = activity.record(&path, kind) {
                            log::warn!("Could not record {:?} for {:?}: {}", kind, path, e);
                        }
                    }
                }
                Err(e) => log::error!("Watch error: {:?}", e),
            },
            Config::default(),
        )
        .map_err(|e| EngineError::new(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .map_err(|e| EngineError::new(format!("Could not watch {:?}: {}", root, e)))?;
        log::info!("Watching {:?} for activity", root);

        Ok(Self { _watcher: watcher, root })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// Maps a raw notification onto activity events. Access notifications are too
/// noisy to keep.
fn classify(event: &Event) -> Vec<(PathBuf, ActivityKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => ActivityKind::Created,
        EventKind::Remove(_) => ActivityKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            return event.paths.last().map(|p| vec![(p.clone(), ActivityKind::Moved)]).unwrap_or_default();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ActivityKind::Moved,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ActivityKind::Deleted,
        EventKind::Modify(ModifyKind::Data(_)) => ActivityKind::Accessed,
        _ => return Vec::new(),
    };
    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    #[test]
    fn test_classify_events() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/d/a.txt".into());
        assert_eq!(classify(&created), vec![(PathBuf::from("/d/a.txt"), ActivityKind::Created)]);

        let removed = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path("/d/work".into());
        assert_eq!(classify(&removed)[0].1, ActivityKind::Deleted);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/d/a.txt".into())
            .add_path("/d/b.txt".into());
        assert_eq!(classify(&renamed), vec![(PathBuf::from("/d/b.txt"), ActivityKind::Moved)]);

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path("/d/a.txt".into());
        assert_eq!(classify(&written)[0].1, ActivityKind::Accessed);

        let read = Event::new(EventKind::Access(AccessKind::Read)).add_path("/d/a.txt".into());
        assert!(classify(&read).is_empty());
    }
}
