pub mod commands;
pub mod engine;
pub mod models;
pub mod systems;
pub mod utils;

pub use commands::interpreter::{CommandOutcome, CommandRecord};
pub use engine::{Engine, UndoOutcome};
pub use models::{EngineConfig, EngineError, ErrorKind, OperationKind, OperationRequest, OperationResult};

/// Installs the env_logger backend. Hosts call this once at startup;
/// `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
