use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Move,
    Copy,
    Rename,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// What to do when the landing path of a Create/Move/Copy/Rename is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// `name (1).ext`, `name (2).ext`, ...
    #[default]
    Suffix,
    Overwrite,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    #[default]
    Directory,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
    #[serde(default)]
    pub collision: CollisionPolicy,
    #[serde(default)]
    pub entry: EntryType,
    #[serde(default)]
    pub content: Option<String>,
}

/// A single requested mutation. `destination` is the target directory for
/// Move/Copy and the full new path for Rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub id: String,
    pub kind: OperationKind,
    pub targets: Vec<PathBuf>,
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub params: OperationParams,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, targets: Vec<PathBuf>, destination: Option<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            targets,
            destination,
            params: OperationParams::default(),
        }
    }

    pub fn create_dir(path: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Create, vec![path.into()], None)
    }

    pub fn create_file(path: impl Into<PathBuf>, content: Option<String>) -> Self {
        let mut req = Self::new(OperationKind::Create, vec![path.into()], None);
        req.params.entry = EntryType::File;
        req.params.content = content;
        req
    }

    pub fn move_to(targets: Vec<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Move, targets, Some(destination.into()))
    }

    pub fn copy_to(targets: Vec<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Copy, targets, Some(destination.into()))
    }

    pub fn rename(target: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Rename, vec![target.into()], Some(new_path.into()))
    }

    pub fn delete(targets: Vec<PathBuf>) -> Self {
        Self::new(OperationKind::Delete, targets, None)
    }

    pub fn with_collision(mut self, policy: CollisionPolicy) -> Self {
        self.params.collision = policy;
        self
    }

    /// Paths that Move/Copy will land at inside `destination`.
    pub fn landing_paths(&self) -> Vec<PathBuf> {
        match (self.kind, &self.destination) {
            (OperationKind::Move | OperationKind::Copy, Some(dest)) => self
                .targets
                .iter()
                .filter_map(|t| t.file_name().map(|name| dest.join(name)))
                .collect(),
            (OperationKind::Rename, Some(dest)) => vec![dest.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub success: bool,
    pub kind: OperationKind,
    pub affected: Vec<PathBuf>,
    pub error: Option<EngineError>,
    pub timestamp: DateTime<Utc>,
}

impl OperationResult {
    pub fn succeeded(request: &OperationRequest, affected: Vec<PathBuf>) -> Self {
        Self {
            operation_id: request.id.clone(),
            success: true,
            kind: request.kind,
            affected,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(request: &OperationRequest, affected: Vec<PathBuf>, error: EngineError) -> Self {
        Self {
            operation_id: request.id.clone(),
            success: false,
            kind: request.kind,
            affected,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landing_paths_per_kind() {
        let mv = OperationRequest::move_to(vec![PathBuf::from("/d/a.txt"), PathBuf::from("/d/b.txt")], "/d/work");
        assert_eq!(mv.landing_paths(), vec![PathBuf::from("/d/work/a.txt"), PathBuf::from("/d/work/b.txt")]);

        let rn = OperationRequest::rename("/d/a.txt", "/d/c.txt");
        assert_eq!(rn.landing_paths(), vec![PathBuf::from("/d/c.txt")]);

        assert!(OperationRequest::delete(vec![PathBuf::from("/d/a.txt")]).landing_paths().is_empty());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = OperationRequest::create_dir("/d/x");
        let b = OperationRequest::create_dir("/d/x");
        assert_ne!(a.id, b.id);
        assert_eq!(a.params.collision, CollisionPolicy::Suffix);
    }
}
