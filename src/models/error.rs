use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    PrerequisiteMissing,
    RestoreConflict,
    DuplicateRegistration,
    NotFound,
    Expired,
    UnsupportedOperation,
    Io,
    Trash,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    ValidationError(String),
    PermissionDenied(String),
    PrerequisiteMissing(String),
    RestoreConflict(String),
    DuplicateRegistration(String),
    NotFound(String),
    Expired(String),
    UnsupportedOperation(String),
    IoError(String),
    TrashError(String),
    Other(String),
}

impl std::error::Error for EngineError {}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            EngineError::PermissionDenied(msg) => write!(f, "Permission Denied: {}", msg),
            EngineError::PrerequisiteMissing(msg) => write!(f, "Prerequisite Missing: {}", msg),
            EngineError::RestoreConflict(msg) => write!(f, "Restore Conflict: {}", msg),
            EngineError::DuplicateRegistration(msg) => write!(f, "Duplicate Registration: {}", msg),
            EngineError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            EngineError::Expired(msg) => write!(f, "Expired: {}", msg),
            EngineError::UnsupportedOperation(msg) => write!(f, "Unsupported Operation: {}", msg),
            EngineError::IoError(msg) => write!(f, "IO Error: {}", msg),
            EngineError::TrashError(msg) => write!(f, "Trash Error: {}", msg),
            EngineError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(err.to_string()),
            _ => EngineError::IoError(err.to_string()),
        }
    }
}

impl From<fs_extra::error::Error> for EngineError {
    fn from(err: fs_extra::error::Error) -> Self {
        match err.kind {
            fs_extra::error::ErrorKind::PermissionDenied => EngineError::PermissionDenied(err.to_string()),
            _ => EngineError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::ValidationError(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ValidationError(_) => ErrorKind::Validation,
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::PrerequisiteMissing(_) => ErrorKind::PrerequisiteMissing,
            EngineError::RestoreConflict(_) => ErrorKind::RestoreConflict,
            EngineError::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Expired(_) => ErrorKind::Expired,
            EngineError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            EngineError::IoError(_) => ErrorKind::Io,
            EngineError::TrashError(_) => ErrorKind::Trash,
            EngineError::Other(_) => ErrorKind::Other,
        }
    }

    /// Ledger races that callers treat as a no-op rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DuplicateRegistration | ErrorKind::NotFound | ErrorKind::Expired
        )
    }

    /// Same kind, with `context` appended to the message.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        let msg = format!("{} ({})", self.message(), context);
        match self {
            EngineError::ValidationError(_) => EngineError::ValidationError(msg),
            EngineError::PermissionDenied(_) => EngineError::PermissionDenied(msg),
            EngineError::PrerequisiteMissing(_) => EngineError::PrerequisiteMissing(msg),
            EngineError::RestoreConflict(_) => EngineError::RestoreConflict(msg),
            EngineError::DuplicateRegistration(_) => EngineError::DuplicateRegistration(msg),
            EngineError::NotFound(_) => EngineError::NotFound(msg),
            EngineError::Expired(_) => EngineError::Expired(msg),
            EngineError::UnsupportedOperation(_) => EngineError::UnsupportedOperation(msg),
            EngineError::IoError(_) => EngineError::IoError(msg),
            EngineError::TrashError(_) => EngineError::TrashError(msg),
            EngineError::Other(_) => EngineError::Other(msg),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::ValidationError(msg)
            | EngineError::PermissionDenied(msg)
            | EngineError::PrerequisiteMissing(msg)
            | EngineError::RestoreConflict(msg)
            | EngineError::DuplicateRegistration(msg)
            | EngineError::NotFound(msg)
            | EngineError::Expired(msg)
            | EngineError::UnsupportedOperation(msg)
            | EngineError::IoError(msg)
            | EngineError::TrashError(msg)
            | EngineError::Other(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_permission_maps_to_permission_denied() {
        let err: EngineError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err: EngineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_benign_ledger_races() {
        assert!(EngineError::NotFound("op".into()).is_benign());
        assert!(EngineError::Expired("op".into()).is_benign());
        assert!(!EngineError::RestoreConflict("a.txt".into()).is_benign());
    }

    #[test]
    fn test_with_context_keeps_kind() {
        let err = EngineError::IoError("disk full".into()).with_context("already restored: a.txt");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.message(), "disk full (already restored: a.txt)");
    }
}
