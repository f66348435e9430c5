use std::fs;
use std::path::{Path, PathBuf};

use crate::models::EngineError;
use crate::utils::{move_path, unique_destination};

/// Where soft-deleted items go.
pub trait TrashFacility: Send + Sync {
    fn send_to_trash(&self, path: &Path) -> Result<(), EngineError>;
}

/// The platform recycle bin / freedesktop trash.
pub struct SystemTrash;

impl TrashFacility for SystemTrash {
    fn send_to_trash(&self, path: &Path) -> Result<(), EngineError> {
        trash::delete(path).map_err(|e| trash_error(path, e))
    }
}

fn trash_error(path: &Path, err: trash::Error) -> EngineError {
    if is_permission_denied(&err) {
        EngineError::PermissionDenied(format!("Cannot delete {}: {}", path.display(), err))
    } else {
        EngineError::TrashError(err.to_string())
    }
}

// Only the freedesktop backend reports raw io errors.
#[cfg(all(unix, not(target_os = "macos"), not(target_os = "ios"), not(target_os = "android")))]
fn is_permission_denied(err: &trash::Error) -> bool {
    matches!(err, trash::Error::FileSystem { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
}

#[cfg(not(all(unix, not(target_os = "macos"), not(target_os = "ios"), not(target_os = "android"))))]
fn is_permission_denied(_err: &trash::Error) -> bool {
    false
}

/// A plain directory acting as the trash. Used where no platform trash is
/// available and by tests.
pub struct DirectoryTrash {
    root: PathBuf,
}

impl DirectoryTrash {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TrashFacility for DirectoryTrash {
    fn send_to_trash(&self, path: &Path) -> Result<(), EngineError> {
        let name = path
            .file_name()
            .ok_or_else(|| EngineError::validation(format!("Cannot trash {}", path.display())))?;
        let target = unique_destination(&self.root.join(name));
        move_path(path, &target)
    }
}
