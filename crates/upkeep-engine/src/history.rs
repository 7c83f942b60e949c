//! Bounded, append-only update history

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::models::{HistoryEntry, SessionError, Severity, UpdateSession, UpdateStatus};

/// Append-only audit log of update attempts, capped at a fixed number of
/// entries (oldest evicted first) and persisted as a JSON file.
///
/// Entries are never mutated after being written.
pub struct HistoryLogger {
    path: PathBuf,
    capacity: usize,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryLogger {
    /// Open the history at `path`, loading any persisted entries
    pub fn new<P: Into<PathBuf>>(path: P, capacity: usize) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Vec<HistoryEntry>>(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), "discarding unreadable history: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            capacity,
            entries: Mutex::new(entries),
        }
    }

    /// Append an entry, evicting the oldest once the cap is exceeded
    pub fn log(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().expect("history mutex poisoned");
        entries.push(entry);
        while entries.len() > self.capacity {
            entries.remove(0);
        }
        self.persist(&entries);
    }

    /// The most recent entries, newest first
    pub fn get_history(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history mutex poisoned");
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Build the audit record for a terminal session
    pub fn entry_for(session: &UpdateSession) -> HistoryEntry {
        HistoryEntry {
            timestamp: session.completed_at.unwrap_or_else(Utc::now),
            trigger_location: session.trigger_location,
            target_version: session.target_version.clone(),
            status: session.status,
            actor: session.actor.clone(),
            error_message: session.error.as_ref().map(|e| e.message.clone()),
            severity: severity_for(session.status, session.error.as_ref()),
        }
    }

    fn persist(&self, entries: &[HistoryEntry]) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            let json = serde_json::to_string_pretty(entries)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(path = %self.path.display(), "failed to persist history: {e}");
        }
    }
}

/// Severity assigned to a terminal state:
/// INFO for a verified success, WARNING for a failure before any backup
/// existed, ERROR for a failure that was rolled back cleanly, CRITICAL
/// when the restore itself failed and manual recovery is required.
pub fn severity_for(status: UpdateStatus, error: Option<&SessionError>) -> Severity {
    match status {
        UpdateStatus::Complete => Severity::Info,
        UpdateStatus::RolledBack => Severity::Error,
        UpdateStatus::Failed => {
            let restore_failed = error
                .map(|e| e.context.get("phase").map(String::as_str) == Some("restore"))
                .unwrap_or(false);
            if restore_failed {
                Severity::Critical
            } else {
                Severity::Warning
            }
        }
        _ => Severity::Info,
    }
}
