pub mod activity;
pub mod backup;
pub mod config;
pub mod error;
pub mod ledger;
pub mod operation;

pub use error::{EngineError, ErrorKind};
pub type Result<T> = std::result::Result<T, EngineError>;

pub use activity::{ActivityEvent, ActivityKind, ActivityLog, ActivitySummary, UsageCount};
pub use backup::{BackupRecord, Fingerprint};
pub use config::{ConfigManager, EngineConfig};
pub use ledger::{UndoEntry, UndoLedger};
pub use operation::{CollisionPolicy, EntryType, OperationKind, OperationParams, OperationRequest, OperationResult};
