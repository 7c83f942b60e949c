//! Single-update lock
//!
//! The update-in-progress guard is an entry in a shared, expiring
//! key-value store rather than an in-process flag, so two host processes
//! (say an interactive trigger and a scheduled one) cannot advance the
//! same update concurrently. The expiry doubles as crash recovery.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, UpdateError};

/// The value stored under a lock key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    /// Identity that acquired the lock
    pub holder: String,
    /// When the lock was acquired
    pub started_at: DateTime<Utc>,
    /// When the entry stops counting as held
    pub expires_at: DateTime<Utc>,
}

impl LockEntry {
    fn new(holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder: holder.to_string(),
            started_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
        }
    }

    /// Whether the entry still counts as held
    pub fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Shared key-value store with set-if-absent and expiry semantics,
/// used only for the update-in-progress guard
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically claim `key` for `holder`. Fails immediately with
    /// [`UpdateError::UpdateInProgress`] if a live entry exists; there is
    /// no queueing or blocking wait.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<LockEntry>;

    /// Drop the entry for `key`. Releasing an absent key is a no-op.
    async fn release(&self, key: &str) -> Result<()>;

    /// Read the current entry for `key`, live or expired
    async fn current(&self, key: &str) -> Result<Option<LockEntry>>;
}

/// File-backed lock store: one JSON entry file per key.
///
/// `create_new` gives the set-if-absent atomicity; expired entries are
/// taken over under an exclusive advisory lock so two processes cannot
/// both claim the same stale entry.
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.lock.json"))
    }

    fn read_entry(path: &Path) -> Option<LockEntry> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<LockEntry> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let entry = LockEntry::new(holder, ttl);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                serde_json::to_writer(&file, &entry)?;
                file.sync_all()?;
                info!(key, holder, "acquired update lock");
                Ok(entry)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // An unreadable entry is treated like an expired one: the
                // only way forward is taking it over.
                let existing = Self::read_entry(&path);
                if let Some(existing) = &existing {
                    if existing.is_live() {
                        debug!(key, holder = %existing.holder, "update lock is held");
                        return Err(UpdateError::UpdateInProgress {
                            holder: existing.holder.clone(),
                            started_at: existing.started_at,
                        });
                    }
                }

                let mut file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)?;
                file.try_lock_exclusive().map_err(|_| {
                    let e = existing.clone().unwrap_or_else(|| entry.clone());
                    UpdateError::UpdateInProgress {
                        holder: e.holder,
                        started_at: e.started_at,
                    }
                })?;

                // Re-read under the advisory lock: another process may have
                // completed the takeover first.
                let mut content = String::new();
                file.read_to_string(&mut content)?;
                if let Ok(current) = serde_json::from_str::<LockEntry>(&content) {
                    if current.is_live() {
                        let _ = file.unlock();
                        return Err(UpdateError::UpdateInProgress {
                            holder: current.holder,
                            started_at: current.started_at,
                        });
                    }
                }

                file.set_len(0)?;
                use std::io::{Seek, SeekFrom, Write};
                file.seek(SeekFrom::Start(0))?;
                file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
                file.sync_all()?;
                let _ = file.unlock();
                info!(key, holder, "took over expired update lock");
                Ok(entry)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(key, "released update lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(key, "failed to release update lock: {e}");
                Err(e.into())
            }
        }
    }

    async fn current(&self, key: &str) -> Result<Option<LockEntry>> {
        Ok(Self::read_entry(&self.path_for(key)))
    }
}

/// In-memory lock store with the same semantics, for tests and embedded
/// single-process hosts
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<LockEntry> {
        let mut entries = self.entries.lock().expect("lock store mutex poisoned");
        if let Some(existing) = entries.get(key) {
            if existing.is_live() {
                return Err(UpdateError::UpdateInProgress {
                    holder: existing.holder.clone(),
                    started_at: existing.started_at,
                });
            }
        }
        let entry = LockEntry::new(holder, ttl);
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("lock store mutex poisoned")
            .remove(key);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LockEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("lock store mutex poisoned")
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_and_release() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(temp.path());

        store
            .try_acquire("update.unit", "alice", Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .try_acquire("update.unit", "bob", Duration::from_secs(60))
            .await
            .unwrap_err();
        match err {
            UpdateError::UpdateInProgress { holder, .. } => assert_eq!(holder, "alice"),
            other => panic!("expected UpdateInProgress, got {other:?}"),
        }

        store.release("update.unit").await.unwrap();
        store
            .try_acquire("update.unit", "bob", Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_entry_is_taken_over() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(temp.path());

        store
            .try_acquire("update.unit", "crashed", Duration::from_secs(0))
            .await
            .unwrap();
        let entry = store
            .try_acquire("update.unit", "fresh", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(entry.holder, "fresh");
    }

    #[tokio::test]
    async fn release_of_absent_key_is_a_noop() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(temp.path());
        store.release("update.never-held").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquisition_has_exactly_one_winner() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileLockStore::new(temp.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire("update.unit", &format!("worker-{i}"), Duration::from_secs(60))
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn memory_store_matches_file_semantics() {
        let store = MemoryLockStore::new();
        store
            .try_acquire("update.unit", "alice", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store
            .try_acquire("update.unit", "bob", Duration::from_secs(60))
            .await
            .is_err());
        store.release("update.unit").await.unwrap();
        assert!(store.current("update.unit").await.unwrap().is_none());
    }
}
