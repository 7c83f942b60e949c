//! Safe self-update engine
//!
//! Checks a remote release registry for a newer version of one installed
//! unit, downloads and validates the release package, backs up the current
//! installation, installs the new version, and rolls back automatically if
//! anything fails after the backup exists.
//!
//! The [`UpdateEngine`] facade wires the components together; each is also
//! usable on its own:
//!
//! - [`resolver::ReleaseResolver`] — registry queries with a TTL cache
//! - [`validator::DownloadValidator`] — size and archive integrity checks
//! - [`backup::BackupManager`] — snapshot, restore, and retention
//! - [`normalizer::DirectoryNormalizer`] — release directory naming
//! - [`orchestrator::UpdateOrchestrator`] — the state machine
//! - [`history::HistoryLogger`] — bounded audit log
//! - [`messages`] — operator-facing error guidance

pub mod backup;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod lock;
pub mod messages;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod resolver;
pub mod validator;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub use crate::backup::BackupManager;
pub use crate::config::EngineConfig;
pub use crate::error::{ErrorCode, Result, UpdateError};
pub use crate::fetcher::{HttpPackageFetcher, PackageFetcher};
pub use crate::history::HistoryLogger;
pub use crate::lock::{FileLockStore, LockStore, MemoryLockStore};
pub use crate::models::{
    BackupArchive, HistoryEntry, ReleaseInfo, SessionError, Severity, TriggerLocation,
    UpdateCheck, UpdateSession, UpdateStatus,
};
pub use crate::normalizer::DirectoryNormalizer;
pub use crate::orchestrator::UpdateOrchestrator;
pub use crate::resolver::ReleaseResolver;
pub use crate::validator::DownloadValidator;

/// File inside the installation directory recording the installed version
pub const VERSION_MARKER: &str = "version.txt";

/// Facade over the update components for one installed unit
pub struct UpdateEngine {
    config: EngineConfig,
    resolver: ReleaseResolver,
    validator: DownloadValidator,
    backups: BackupManager,
    lock: Arc<dyn LockStore>,
    orchestrator: Arc<UpdateOrchestrator>,
    history: Arc<HistoryLogger>,
    active: Arc<RwLock<HashMap<Uuid, Arc<RwLock<UpdateSession>>>>>,
}

impl UpdateEngine {
    /// Build an engine with the default file-backed lock store and HTTP
    /// package fetcher
    pub fn new(config: EngineConfig) -> Result<Self> {
        let lock: Arc<dyn LockStore> =
            Arc::new(FileLockStore::new(config.state_dir.join("locks")));
        let fetcher: Arc<dyn PackageFetcher> = Arc::new(HttpPackageFetcher::new());
        Self::with_components(config, fetcher, lock)
    }

    /// Build an engine with caller-supplied fetcher and lock store
    /// (used by tests and embedding hosts)
    pub fn with_components(
        config: EngineConfig,
        fetcher: Arc<dyn PackageFetcher>,
        lock: Arc<dyn LockStore>,
    ) -> Result<Self> {
        config.validate()?;

        let resolver = ReleaseResolver::new(config.registry_url.clone(), config.cache_ttl());
        let validator = DownloadValidator::new(config.size_tolerance);
        let backups = BackupManager::new(config.restore_timeout());
        let normalizer = DirectoryNormalizer::new(config.entry_point.clone());
        let history = Arc::new(HistoryLogger::new(
            config.history_path(),
            config.history_capacity,
        ));
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            config.clone(),
            resolver.clone(),
            fetcher,
            validator.clone(),
            backups.clone(),
            normalizer,
            Arc::clone(&lock),
            Arc::clone(&history),
        ));

        Ok(Self {
            config,
            resolver,
            validator,
            backups,
            lock,
            orchestrator,
            history,
            active: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Version currently installed, read from the installation's version
    /// marker file
    pub fn current_version(&self) -> Result<semver::Version> {
        let marker = self.config.install_dir.join(VERSION_MARKER);
        let content = std::fs::read_to_string(&marker).map_err(|e| {
            UpdateError::config(format!(
                "cannot read version marker {}: {e}",
                marker.display()
            ))
        })?;
        Ok(semver::Version::parse(content.trim())?)
    }

    /// Compare the installed version against the registry's latest release
    pub async fn check_for_update(&self, force: bool) -> Result<UpdateCheck> {
        let current = self.current_version()?;
        self.resolver.check_for_update(&current, force).await
    }

    /// Start an update in the background and return its session id.
    ///
    /// Fails immediately with [`UpdateError::UpdateInProgress`] when
    /// another update holds the lock. Poll [`Self::get_status`] for
    /// progress; the terminal outcome lands in the history.
    pub async fn request_update(
        &self,
        target_version: Option<semver::Version>,
        trigger_location: TriggerLocation,
        actor: &str,
    ) -> Result<Uuid> {
        let session = self.begin(target_version, trigger_location, actor).await?;
        let id = session.read().await.id;

        let orchestrator = Arc::clone(&self.orchestrator);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            orchestrator.run(Arc::clone(&session)).await;
            active.write().await.remove(&id);
        });
        Ok(id)
    }

    /// Run an update to completion and return the terminal session
    /// (command-line callers)
    pub async fn run_update(
        &self,
        target_version: Option<semver::Version>,
        trigger_location: TriggerLocation,
        actor: &str,
    ) -> Result<UpdateSession> {
        let session = self.begin(target_version, trigger_location, actor).await?;
        let id = session.read().await.id;
        let final_session = self.orchestrator.run(session).await;
        self.active.write().await.remove(&id);
        Ok(final_session)
    }

    /// Snapshot of an active session's state
    pub async fn get_status(&self, session_id: Uuid) -> Result<UpdateSession> {
        let active = self.active.read().await;
        match active.get(&session_id) {
            Some(session) => Ok(session.read().await.clone()),
            None => Err(UpdateError::SessionNotFound(session_id)),
        }
    }

    /// The most recent update attempts, newest first
    pub fn get_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.get_history(limit)
    }

    /// Remove leftover engine-owned downloads older than `max_age`
    /// (intended to be called on a daily schedule by the host)
    pub fn cleanup_orphans(&self, max_age: Duration) -> Result<usize> {
        self.validator
            .cleanup_orphans(&self.config.download_dir, max_age)
    }

    /// Delete a backup archive; idempotent
    pub fn delete_backup(&self, path: &Path) -> bool {
        self.backups.delete_backup(path)
    }

    /// Enumerate retained backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        self.backups.list_backups(&self.config.backup_dir)
    }

    /// Acquire the lock and open a session, releasing the lock again if
    /// session setup fails
    async fn begin(
        &self,
        target_version: Option<semver::Version>,
        trigger_location: TriggerLocation,
        actor: &str,
    ) -> Result<Arc<RwLock<UpdateSession>>> {
        self.orchestrator.acquire_lock(actor).await?;

        let setup = async {
            let current = self.current_version()?;
            let target = match target_version {
                Some(version) => version,
                None => self.resolver.resolve(false).await?.version,
            };
            Ok::<_, UpdateError>(UpdateSession::new(
                current,
                target,
                trigger_location,
                actor.to_string(),
            ))
        }
        .await;

        let session = match setup {
            Ok(session) => session,
            Err(e) => {
                if let Err(release_err) = self.lock.release(&self.config.lock_key()).await {
                    warn!("failed to release update lock after setup error: {release_err}");
                }
                return Err(e);
            }
        };

        let session = Arc::new(RwLock::new(session));
        let id = session.read().await.id;
        self.active.write().await.insert(id, Arc::clone(&session));
        Ok(session)
    }
}
