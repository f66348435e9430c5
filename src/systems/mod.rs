pub mod activity_watcher;
pub mod backup_store;
pub mod file_ops;
pub mod scheduler;
pub mod sweeper;
pub mod trash;
