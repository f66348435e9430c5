use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Accessed,
    Created,
    Moved,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub path: PathBuf,
    pub event_kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub accessed: usize,
    pub created: usize,
    pub moved: usize,
    pub deleted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageCount {
    pub path: PathBuf,
    pub count: usize,
    pub last_seen: DateTime<Utc>,
}

/// Append-only record of per-item activity. Events are only ever appended or
/// purged by `prune_at`; the optional backing file is a JSON-lines log.
pub struct ActivityLog {
    events: Mutex<Vec<ActivityEvent>>,
    log_file: Option<PathBuf>,
    retention: Duration,
    ignore_patterns: Vec<String>,
}

impl ActivityLog {
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            log_file: None,
            retention,
            ignore_patterns: Vec::new(),
        }
    }

    /// Opens (or creates) the log at `log_file`, loading every event still on disk.
    /// Lines that fail to parse are skipped.
    pub fn open(log_file: &Path, retention: Duration, ignore_patterns: Vec<String>) -> Result<Self, EngineError> {
        let mut events = Vec::new();
        if log_file.exists() {
            let content = fs::read_to_string(log_file)?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<ActivityEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(e) => log::warn!("Skipping unreadable activity line: {}", e),
                }
            }
        } else if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            events: Mutex::new(events),
            log_file: Some(log_file.to_path_buf()),
            retention,
            ignore_patterns: ignore_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        })
    }

    pub fn should_ignore(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_lowercase(),
            None => return false,
        };
        self.ignore_patterns.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn record(&self, path: &Path, kind: ActivityKind) -> Result<(), EngineError> {
        self.record_at(path, kind, Utc::now())
    }

    pub fn record_at(&self, path: &Path, kind: ActivityKind, timestamp: DateTime<Utc>) -> Result<(), EngineError> {
        if self.should_ignore(path) {
            return Ok(());
        }

        let event = ActivityEvent {
            path: path.to_path_buf(),
            event_kind: kind,
            timestamp,
        };

        // Append under the lock so the file order matches the in-memory order.
        let mut events = self.events.lock().map_err(|_| EngineError::new("Failed to lock activity log"))?;
        if let Some(ref file) = self.log_file {
            let line = serde_json::to_string(&event)?;
            let mut handle = OpenOptions::new().create(true).append(true).open(file)?;
            writeln!(handle, "{}", line)?;
        }
        events.push(event);
        Ok(())
    }

    /// Removes events older than the retention period. Returns how many were dropped.
    pub fn prune_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let cutoff = now - self.retention;
        let mut events = self.events.lock().map_err(|_| EngineError::new("Failed to lock activity log"))?;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        let removed = before - events.len();

        if removed > 0 {
            if let Some(ref file) = self.log_file {
                let mut out = String::new();
                for event in events.iter() {
                    out.push_str(&serde_json::to_string(event)?);
                    out.push('\n');
                }
                fs::write(file, out)?;
            }
        }
        Ok(removed)
    }

    fn live_events(&self, now: DateTime<Utc>) -> Vec<ActivityEvent> {
        let cutoff = now - self.retention;
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Events from the last `hours` hours, oldest first.
    pub fn recent(&self, hours: i64) -> Vec<ActivityEvent> {
        let now = Utc::now();
        let cutoff = now - Duration::hours(hours);
        self.live_events(now).into_iter().filter(|e| e.timestamp >= cutoff).collect()
    }

    pub fn summary(&self, hours: i64) -> ActivitySummary {
        let mut summary = ActivitySummary::default();
        for event in self.recent(hours) {
            match event.event_kind {
                ActivityKind::Accessed => summary.accessed += 1,
                ActivityKind::Created => summary.created += 1,
                ActivityKind::Moved => summary.moved += 1,
                ActivityKind::Deleted => summary.deleted += 1,
            }
            summary.total += 1;
        }
        summary
    }

    fn usage_at(&self, now: DateTime<Utc>) -> Vec<UsageCount> {
        let mut counts: HashMap<PathBuf, UsageCount> = HashMap::new();
        for event in self.live_events(now) {
            let entry = counts.entry(event.path.clone()).or_insert(UsageCount {
                path: event.path.clone(),
                count: 0,
                last_seen: event.timestamp,
            });
            entry.count += 1;
            if event.timestamp > entry.last_seen {
                entry.last_seen = event.timestamp;
            }
        }
        counts.into_values().collect()
    }

    /// Paths with the most events, most recently seen first on ties.
    pub fn most_used(&self, limit: usize) -> Vec<UsageCount> {
        self.most_used_at(limit, Utc::now())
    }

    pub fn most_used_at(&self, limit: usize, now: DateTime<Utc>) -> Vec<UsageCount> {
        let mut usage = self.usage_at(now);
        usage.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen.cmp(&a.last_seen)));
        usage.truncate(limit);
        usage
    }

    /// Paths with the fewest events, least recently seen first on ties.
    pub fn least_used(&self, limit: usize) -> Vec<UsageCount> {
        self.least_used_at(limit, Utc::now())
    }

    pub fn least_used_at(&self, limit: usize, now: DateTime<Utc>) -> Vec<UsageCount> {
        let mut usage = self.usage_at(now);
        usage.sort_by(|a, b| a.count.cmp(&b.count).then(a.last_seen.cmp(&b.last_seen)));
        usage.truncate(limit);
        usage
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prune_drops_events_past_retention() {
        let log = ActivityLog::in_memory(Duration::days(2));
        let now = Utc::now();
        log.record_at(Path::new("/d/old.txt"), ActivityKind::Created, now - Duration::days(2) - Duration::seconds(1)).unwrap();
        log.record_at(Path::new("/d/edge.txt"), ActivityKind::Created, now - Duration::days(2) + Duration::seconds(1)).unwrap();
        log.record_at(Path::new("/d/new.txt"), ActivityKind::Accessed, now).unwrap();

        assert_eq!(log.prune_at(now).unwrap(), 1);
        let paths: Vec<PathBuf> = log.most_used_at(10, now).into_iter().map(|u| u.path).collect();
        assert!(!paths.contains(&PathBuf::from("/d/old.txt")));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_queries_never_return_expired_events_even_before_sweep() {
        let log = ActivityLog::in_memory(Duration::days(2));
        let now = Utc::now();
        log.record_at(Path::new("/d/stale.txt"), ActivityKind::Accessed, now - Duration::days(3)).unwrap();
        assert!(log.most_used_at(10, now).is_empty());
        assert!(log.least_used_at(10, now).is_empty());
    }

    #[test]
    fn test_most_and_least_used() {
        let log = ActivityLog::in_memory(Duration::days(2));
        let now = Utc::now();
        for _ in 0..3 {
            log.record_at(Path::new("/d/hot.txt"), ActivityKind::Accessed, now).unwrap();
        }
        log.record_at(Path::new("/d/cold.txt"), ActivityKind::Accessed, now - Duration::hours(5)).unwrap();
        log.record_at(Path::new("/d/warm.txt"), ActivityKind::Accessed, now).unwrap();
        log.record_at(Path::new("/d/warm.txt"), ActivityKind::Moved, now).unwrap();

        let most = log.most_used_at(1, now);
        assert_eq!(most[0].path, PathBuf::from("/d/hot.txt"));
        assert_eq!(most[0].count, 3);

        let least = log.least_used_at(2, now);
        assert_eq!(least[0].path, PathBuf::from("/d/cold.txt"));
        assert_eq!(least[1].path, PathBuf::from("/d/warm.txt"));
    }

    #[test]
    fn test_ignored_names_are_not_recorded() {
        let dir = tempdir().unwrap();
        let log = ActivityLog::open(&dir.path().join("activity.jsonl"), Duration::days(2), vec!["Thumbs.db".into(), "~$".into()]).unwrap();
        log.record(Path::new("/d/thumbs.db"), ActivityKind::Created).unwrap();
        log.record(Path::new("/d/~$report.docx"), ActivityKind::Created).unwrap();
        log.record(Path::new("/d/report.docx"), ActivityKind::Created).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.summary(24).created, 1);
    }

    #[test]
    fn test_log_survives_reopen_and_prune_rewrites_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("state").join("activity.jsonl");
        let now = Utc::now();
        {
            let log = ActivityLog::open(&file, Duration::days(2), Vec::new()).unwrap();
            log.record_at(Path::new("/d/a.txt"), ActivityKind::Created, now - Duration::days(5)).unwrap();
            log.record_at(Path::new("/d/b.txt"), ActivityKind::Deleted, now).unwrap();
        }

        let reopened = ActivityLog::open(&file, Duration::days(2), Vec::new()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.prune_at(now).unwrap(), 1);

        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("b.txt"));
    }
}
