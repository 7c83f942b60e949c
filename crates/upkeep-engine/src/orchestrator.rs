//! Update orchestration state machine
//!
//! Drives one update attempt through
//! `checking → downloading → validating → backing_up → extracting →
//! normalizing → installing → verifying → complete`, with `failed` or
//! `rolled_back` exits. The backup strictly precedes every destructive
//! filesystem step: failures before it leave the installation untouched,
//! failures after it trigger a restore.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::config::EngineConfig;
use crate::error::{Result, UpdateError};
use crate::fetcher::PackageFetcher;
use crate::history::HistoryLogger;
use crate::lock::LockStore;
use crate::models::{BackupArchive, SessionError, UpdateSession, UpdateStatus};
use crate::normalizer::DirectoryNormalizer;
use crate::resolver::ReleaseResolver;
use crate::validator::DownloadValidator;

/// Sequences the update components and owns the single-update lock for
/// the duration of a session
#[derive(Clone)]
pub struct UpdateOrchestrator {
    config: EngineConfig,
    resolver: ReleaseResolver,
    fetcher: Arc<dyn PackageFetcher>,
    validator: DownloadValidator,
    backups: BackupManager,
    normalizer: DirectoryNormalizer,
    lock: Arc<dyn LockStore>,
    history: Arc<HistoryLogger>,
}

impl UpdateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        resolver: ReleaseResolver,
        fetcher: Arc<dyn PackageFetcher>,
        validator: DownloadValidator,
        backups: BackupManager,
        normalizer: DirectoryNormalizer,
        lock: Arc<dyn LockStore>,
        history: Arc<HistoryLogger>,
    ) -> Self {
        Self {
            config,
            resolver,
            fetcher,
            validator,
            backups,
            normalizer,
            lock,
            history,
        }
    }

    /// Claim the single-update lock for this unit.
    ///
    /// Fails immediately with [`UpdateError::UpdateInProgress`] when the
    /// lock is held; there is no queueing. The expiry on the entry covers
    /// crashed holders.
    pub async fn acquire_lock(&self, holder: &str) -> Result<()> {
        self.lock
            .try_acquire(&self.config.lock_key(), holder, self.config.lock_ttl())
            .await
            .map(|_| ())
    }

    /// Drive a session to a terminal state.
    ///
    /// The caller must hold the update lock; it is released here on every
    /// terminal path, and exactly one history entry is written.
    pub async fn run(&self, session: Arc<RwLock<UpdateSession>>) -> UpdateSession {
        self.drive(&session).await;

        let final_session = session.read().await.clone();
        self.history.log(HistoryLogger::entry_for(&final_session));
        if let Err(e) = self.lock.release(&self.config.lock_key()).await {
            warn!("failed to release update lock: {e}");
        }
        info!(
            id = %final_session.id,
            status = %final_session.status,
            "update session finished"
        );
        final_session
    }

    async fn drive(&self, session: &Arc<RwLock<UpdateSession>>) {
        let (target_version, current_version) = {
            let s = session.read().await;
            (s.target_version.clone(), s.current_version.clone())
        };

        // checking
        let release = match self.resolver.resolve(false).await {
            Ok(release) => release,
            Err(e) => return self.fail(session, e, UpdateStatus::Checking).await,
        };
        if release.version != target_version {
            let e = UpdateError::VersionUnavailable {
                requested: target_version,
                latest: release.version,
            };
            return self.fail(session, e, UpdateStatus::Checking).await;
        }

        // downloading
        self.advance(session, UpdateStatus::Downloading).await;
        let package = match self
            .fetcher
            .fetch(&self.config.unit_name, &release, &self.config.download_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => return self.fail(session, e, UpdateStatus::Downloading).await,
        };

        // validating: a rejected download never stays on disk
        self.advance(session, UpdateStatus::Validating).await;
        if let Err(e) = self
            .validator
            .validate_size(&package, release.size_bytes)
            .and_then(|()| self.validator.validate_archive(&package))
        {
            self.validator.cleanup_invalid(&package);
            return self.fail(session, e, UpdateStatus::Validating).await;
        }

        // backing_up: everything after this point can be rolled back
        self.advance(session, UpdateStatus::BackingUp).await;
        let backup = match self
            .backups
            .create_backup(
                &current_version,
                &self.config.install_dir,
                &self.config.backup_dir,
            )
            .await
        {
            Ok(backup) => backup,
            Err(e) => return self.fail(session, e, UpdateStatus::BackingUp).await,
        };

        // extracting
        self.advance(session, UpdateStatus::Extracting).await;
        let staging = match self.make_staging_dir() {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .fail_with_rollback(session, e, UpdateStatus::Extracting, &backup)
                    .await
            }
        };
        let extracted = match extract_package(&package, staging.path()) {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .fail_with_rollback(session, e, UpdateStatus::Extracting, &backup)
                    .await
            }
        };

        // normalizing
        self.advance(session, UpdateStatus::Normalizing).await;
        let normalized = match self
            .normalizer
            .normalize(&extracted, staging.path(), &self.config.unit_name)
        {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .fail_with_rollback(session, e, UpdateStatus::Normalizing, &backup)
                    .await
            }
        };

        // installing
        self.advance(session, UpdateStatus::Installing).await;
        if let Err(e) = self.swap_installation(&normalized) {
            return self
                .fail_with_rollback(session, e, UpdateStatus::Installing, &backup)
                .await;
        }

        // verifying
        self.advance(session, UpdateStatus::Verifying).await;
        let entry_point = self.config.install_dir.join(&self.config.entry_point);
        if !entry_point.is_file() {
            let e = UpdateError::invalid_structure(
                &self.config.install_dir,
                format!("entry point {} missing after install", self.config.entry_point),
            );
            return self
                .fail_with_rollback(session, e, UpdateStatus::Verifying, &backup)
                .await;
        }

        // complete: the verified install no longer needs its safety net
        if !self.backups.delete_backup(&backup.file_path) {
            warn!(path = %backup.file_path.display(), "backup left behind after success");
        }
        if let Err(e) = std::fs::remove_file(&package) {
            warn!(path = %package.display(), "installed package not removed: {e}");
        }

        let mut s = session.write().await;
        s.status = UpdateStatus::Complete;
        s.completed_at = Some(chrono::Utc::now());
        info!(id = %s.id, version = %s.target_version, "update complete");
    }

    async fn advance(&self, session: &Arc<RwLock<UpdateSession>>, status: UpdateStatus) {
        let mut s = session.write().await;
        s.status = status;
        info!(id = %s.id, status = %status, "update session advanced");
    }

    /// Terminal failure with nothing to roll back: the installation has
    /// not been touched.
    async fn fail(
        &self,
        session: &Arc<RwLock<UpdateSession>>,
        err: UpdateError,
        phase: UpdateStatus,
    ) {
        warn!(phase = %phase, "update failed: {err}");
        let mut s = session.write().await;
        s.status = UpdateStatus::Failed;
        s.error = Some(SessionError::from_error(&err, phase));
        s.completed_at = Some(chrono::Utc::now());
    }

    /// Terminal failure after the backup exists: restore it, ending in
    /// `rolled_back` on success or CRITICAL `failed` when the restore
    /// itself fails.
    async fn fail_with_rollback(
        &self,
        session: &Arc<RwLock<UpdateSession>>,
        err: UpdateError,
        phase: UpdateStatus,
        backup: &BackupArchive,
    ) {
        warn!(phase = %phase, "update failed, restoring backup: {err}");

        match self
            .backups
            .restore_backup(&backup.file_path, &self.config.install_dir)
            .await
        {
            Ok(()) => {
                self.backups.delete_backup(&backup.file_path);
                let mut s = session.write().await;
                s.status = UpdateStatus::RolledBack;
                s.error = Some(SessionError::from_error(&err, phase));
                s.completed_at = Some(chrono::Utc::now());
                info!(id = %s.id, "previous installation restored");
            }
            Err(restore_err) => {
                // The one unrecoverable path: the backup stays on disk for
                // manual recovery.
                error!(
                    backup = %backup.file_path.display(),
                    "restore failed, manual recovery required: {restore_err}"
                );
                let mut s = session.write().await;
                s.status = UpdateStatus::Failed;
                s.error = Some(
                    SessionError::from_error(&restore_err, phase)
                        .with_context("phase", "restore")
                        .with_context("failed_phase", phase.as_str())
                        .with_context("original_error", err.to_string()),
                );
                s.completed_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Staging lives next to the installation so the final rename never
    /// crosses a filesystem boundary.
    fn make_staging_dir(&self) -> Result<tempfile::TempDir> {
        let parent = self
            .config
            .install_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;
        Ok(tempfile::Builder::new()
            .prefix(".upkeep-stage-")
            .tempdir_in(parent)?)
    }

    fn swap_installation(&self, normalized: &Path) -> Result<()> {
        if self.config.install_dir.exists() {
            std::fs::remove_dir_all(&self.config.install_dir)?;
        }
        std::fs::rename(normalized, &self.config.install_dir)?;
        Ok(())
    }
}

/// Unpack the package into `dest` and return its single top-level
/// directory
fn extract_package(package: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(package)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| UpdateError::corrupt_archive(e.to_string()))?;

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(UpdateError::invalid_structure(
            dest,
            "package contains no top-level directory",
        )),
        _ => Err(UpdateError::invalid_structure(
            dest,
            "package contains more than one top-level directory",
        )),
    }
}
