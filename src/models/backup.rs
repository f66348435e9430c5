use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content identity of a path at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fingerprint {
    Absent,
    File { len: u64, digest: String },
    Directory { entries: usize, digest: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub operation_id: String,
    pub original_path: PathBuf,
    /// `None` means the path did not exist when the backup was taken.
    pub stored_copy_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    /// State of `original_path` right after the operation mutated it.
    /// Restoring over anything else is a conflict.
    #[serde(default)]
    pub sealed: Option<Fingerprint>,
}

impl BackupRecord {
    pub fn is_absence_marker(&self) -> bool {
        self.stored_copy_path.is_none()
    }
}
