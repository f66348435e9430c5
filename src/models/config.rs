use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use crate::models::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Folder under management. Relative names resolve under the home directory.
    pub target_folder: PathBuf,
    /// Where backups, the undo ledger and the activity log live.
    pub state_dir: PathBuf,
    pub undo_window_seconds: u64,
    pub activity_retention_days: u64,
    pub sweep_interval_ms: u64,
    /// Soft deletes go here instead of the platform trash when set.
    pub trash_dir: Option<PathBuf>,
    /// Refuse to move/copy/rename dot-prefixed items.
    pub protect_hidden: bool,
    pub watch_activity: bool,
    pub activity_ignore_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_folder: PathBuf::from("Desktop"),
            state_dir: std::env::temp_dir().join("folderly"),
            undo_window_seconds: 30,
            activity_retention_days: 2,
            sweep_interval_ms: 1000,
            trash_dir: None,
            protect_hidden: true,
            watch_activity: false,
            activity_ignore_patterns: [
                "thumbs.db", ".ds_store", "desktop.ini", "~$", ".tmp", ".temp", ".log", ".cache",
                "node_modules", ".git", ".vscode", "__pycache__", ".pytest_cache", ".coverage",
                ".env", ".venv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FOLDERLY_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(folder) = std::env::var("FOLDERLY_TARGET_FOLDER") {
            config.target_folder = PathBuf::from(folder);
        }
        if let Ok(dir) = std::env::var("FOLDERLY_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.undo_window_seconds = std::env::var("FOLDERLY_UNDO_WINDOW_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.undo_window_seconds);
        config.activity_retention_days = std::env::var("FOLDERLY_ACTIVITY_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.activity_retention_days);
        config.sweep_interval_ms = std::env::var("FOLDERLY_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.sweep_interval_ms);
        config
    }

    pub fn undo_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.undo_window_seconds as i64)
    }

    pub fn activity_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.activity_retention_days as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("undo_ledger.json")
    }

    pub fn activity_log_path(&self) -> PathBuf {
        self.state_dir.join("activity.jsonl")
    }

    /// Absolute target root, created if missing.
    pub fn resolve_target_root(&self) -> Result<PathBuf, EngineError> {
        let root = if self.target_folder.is_absolute() {
            self.target_folder.clone()
        } else {
            let home = dirs::home_dir()
                .ok_or_else(|| EngineError::validation("Could not determine the home directory"))?;
            home.join(&self.target_folder)
        };

        if !root.exists() {
            log::info!("Creating target folder {:?}", root);
            fs::create_dir_all(&root)?;
        }
        if !root.is_dir() {
            return Err(EngineError::validation(format!("Target folder is not a directory: {}", root.display())));
        }
        Ok(root)
    }
}

pub struct ConfigManager(pub Mutex<EngineConfig>);

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self(Mutex::new(EngineConfig::default()))
    }

    pub fn get(&self) -> Result<EngineConfig, EngineError> {
        self.0
            .lock()
            .map(|c| c.clone())
            .map_err(|_| EngineError::new("Failed to lock config"))
    }

    pub fn save(&self, config_path: &Path) -> Result<(), EngineError> {
        let config = self.0.lock().map_err(|_| EngineError::new("Failed to lock config"))?;
        if let Some(parent) = config_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&*config)?;
        fs::write(config_path, json)?;
        Ok(())
    }

    pub fn load(&self, config_path: &Path) -> Result<(), EngineError> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let loaded_config: EngineConfig = serde_json::from_str(&content)?;
            let mut config = self.0.lock().map_err(|_| EngineError::new("Failed to lock config"))?;
            *config = loaded_config;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.undo_window(), chrono::Duration::seconds(30));
        assert_eq!(config.activity_retention(), chrono::Duration::days(2));
        assert!(config.protect_hidden);
    }

    #[test]
    fn test_from_env_overrides_and_ignores_garbage() {
        std::env::set_var("FOLDERLY_TARGET_FOLDER", "Projects");
        std::env::set_var("FOLDERLY_UNDO_WINDOW_SECONDS", "120");
        std::env::set_var("FOLDERLY_ACTIVITY_RETENTION_DAYS", "not a number");
        std::env::set_var("FOLDERLY_SWEEP_INTERVAL_MS", "250");
        let config = EngineConfig::from_env();
        for key in [
            "FOLDERLY_TARGET_FOLDER",
            "FOLDERLY_UNDO_WINDOW_SECONDS",
            "FOLDERLY_ACTIVITY_RETENTION_DAYS",
            "FOLDERLY_SWEEP_INTERVAL_MS",
        ] {
            std::env::remove_var(key);
        }

        let defaults = EngineConfig::default();
        assert_eq!(config.target_folder, PathBuf::from("Projects"));
        assert_eq!(config.undo_window(), chrono::Duration::seconds(120));
        assert_eq!(config.activity_retention_days, defaults.activity_retention_days);
        assert_eq!(config.sweep_interval(), std::time::Duration::from_millis(250));
        assert_eq!(config.state_dir, defaults.state_dir);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "undo_window_seconds": 5 }"#).unwrap();

        let manager = ConfigManager::new();
        manager.load(&path).unwrap();
        let config = manager.get().unwrap();
        assert_eq!(config.undo_window_seconds, 5);
        assert_eq!(config.activity_retention_days, 2);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let manager = ConfigManager::new();
        manager.0.lock().unwrap().sweep_interval_ms = 250;
        manager.save(&path).unwrap();

        let other = ConfigManager::new();
        other.load(&path).unwrap();
        assert_eq!(other.get().unwrap().sweep_interval_ms, 250);
    }

    #[test]
    fn test_absolute_target_root_is_created() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            target_folder: dir.path().join("Desktop"),
            ..EngineConfig::default()
        };
        let root = config.resolve_target_root().unwrap();
        assert!(root.is_dir());
    }
}
