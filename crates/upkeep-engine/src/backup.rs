//! Installation backup and restore

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use tar::Archive;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Result, UpdateError};
use crate::models::BackupArchive;

/// Suffix identifying backup archives written by this engine
pub const BACKUP_SUFFIX: &str = ".backup.tar.gz";

/// Safety margin applied to the source size when estimating the space a
/// backup needs
const SPACE_MARGIN_NUM: u64 = 11;
const SPACE_MARGIN_DEN: u64 = 10;

static BACKUP_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<unit>.+)-v(?P<version>\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?)-(?P<ts>\d{14})\.backup\.tar\.gz$",
    )
    .expect("backup name pattern is valid")
});

/// Creates, restores, and deletes point-in-time snapshots of the
/// installation directory.
///
/// A snapshot must exist before any destructive update step, and is only
/// removed once the new installation has been verified (or the snapshot
/// restored).
#[derive(Debug, Clone)]
pub struct BackupManager {
    restore_timeout: Duration,
}

impl BackupManager {
    /// Create a manager with the given restore time budget
    pub fn new(restore_timeout: Duration) -> Self {
        Self { restore_timeout }
    }

    /// Archive `source_dir` into a compressed snapshot inside `backup_dir`.
    ///
    /// Never leaves a partial archive behind: on any error during writing,
    /// the incomplete file is removed before the error is returned.
    pub async fn create_backup(
        &self,
        version: &semver::Version,
        source_dir: &Path,
        backup_dir: &Path,
    ) -> Result<BackupArchive> {
        std::fs::metadata(source_dir)?;

        if std::fs::create_dir_all(backup_dir).is_err() || !dir_is_writable(backup_dir) {
            return Err(UpdateError::BackupDirNotWritable {
                path: backup_dir.to_path_buf(),
            });
        }

        let source_size = dir_size(source_dir);
        let required = source_size * SPACE_MARGIN_NUM / SPACE_MARGIN_DEN;
        let available = fs2::available_space(backup_dir)?;
        if required > available {
            return Err(UpdateError::InsufficientDiskSpace {
                required,
                available,
            });
        }

        let created_at = Utc::now();
        let unit = source_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unit")
            .to_string();
        let file_name = format!(
            "{unit}-v{version}-{}{BACKUP_SUFFIX}",
            created_at.format("%Y%m%d%H%M%S")
        );
        let backup_path = backup_dir.join(file_name);

        info!(path = %backup_path.display(), "creating backup");

        let archive_src = source_dir.to_path_buf();
        let archive_dest = backup_path.clone();
        let top_name = unit.clone();
        let write_result = tokio::task::spawn_blocking(move || {
            build_archive(&archive_src, &archive_dest, &top_name)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        if let Err(e) = write_result {
            // Remove the partial file so a broken snapshot can never be
            // mistaken for a usable one.
            let _ = std::fs::remove_file(&backup_path);
            return Err(e);
        }

        let size_bytes = std::fs::metadata(&backup_path)?.len();
        info!(
            path = %backup_path.display(),
            bytes = size_bytes,
            "backup created"
        );
        Ok(BackupArchive {
            source_version: version.clone(),
            file_path: backup_path,
            created_at,
            size_bytes,
        })
    }

    /// Extract a snapshot back over `target_dir`.
    ///
    /// The archive is integrity-checked before the existing directory is
    /// touched, and the whole operation runs under a bounded time budget
    /// because it sits on the failure path.
    pub async fn restore_backup(&self, backup_path: &Path, target_dir: &Path) -> Result<()> {
        if !backup_path.exists() {
            return Err(UpdateError::BackupNotFound {
                path: backup_path.to_path_buf(),
            });
        }

        info!(
            backup = %backup_path.display(),
            target = %target_dir.display(),
            "restoring backup"
        );

        let bp = backup_path.to_path_buf();
        let td = target_dir.to_path_buf();
        let restored = tokio::time::timeout(
            self.restore_timeout,
            tokio::task::spawn_blocking(move || restore_archive(&bp, &td)),
        )
        .await;

        match restored {
            Err(_) => Err(UpdateError::RestoreTimeout {
                budget_secs: self.restore_timeout.as_secs(),
            }),
            Ok(Err(join_err)) => Err(UpdateError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, join_err.to_string()),
            }),
            Ok(Ok(result)) => result,
        }
    }

    /// Delete a backup archive. Idempotent: returns `true` when the file
    /// was deleted or was already absent.
    pub fn delete_backup(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "deleted backup");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), "failed to delete backup: {e}");
                false
            }
        }
    }

    /// Enumerate engine-owned backups in `backup_dir`, newest first
    pub fn list_backups(&self, backup_dir: &Path) -> Result<Vec<BackupArchive>> {
        if !backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in std::fs::read_dir(backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(parsed) = parse_backup_name(name) else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            backups.push(BackupArchive {
                source_version: parsed.0,
                file_path: entry.path(),
                created_at: parsed.1,
                size_bytes: metadata.len(),
            });
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }
}

/// Parse `{unit}-v{version}-{timestamp}.backup.tar.gz`
fn parse_backup_name(name: &str) -> Option<(semver::Version, DateTime<Utc>)> {
    let caps = BACKUP_NAME_RE.captures(name)?;
    let version = semver::Version::parse(&caps["version"]).ok()?;
    let naive = NaiveDateTime::parse_from_str(&caps["ts"], "%Y%m%d%H%M%S").ok()?;
    Some((version, naive.and_utc()))
}

fn dir_is_writable(dir: &Path) -> bool {
    let probe = dir.join(".upkeep-write-probe");
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Total size of all files under `dir`
fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn build_archive(source_dir: &Path, dest: &Path, top_name: &str) -> Result<()> {
    let file = File::create(dest)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(top_name, source_dir)?;
    let enc = builder.into_inner()?;
    enc.finish()?;
    Ok(())
}

fn restore_archive(backup_path: &Path, target_dir: &Path) -> Result<()> {
    // Integrity pass first: the existing installation is only removed once
    // the whole archive is known to be readable.
    let file = File::open(backup_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut entries = 0usize;
    let listing = archive.entries().map_err(|e| UpdateError::BackupCorrupted {
        path: backup_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    for entry in listing {
        entry.map_err(|e| UpdateError::BackupCorrupted {
            path: backup_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        entries += 1;
    }
    if entries == 0 {
        return Err(UpdateError::BackupCorrupted {
            path: backup_path.to_path_buf(),
            reason: "archive contains no entries".into(),
        });
    }

    if target_dir.exists() {
        std::fs::remove_dir_all(target_dir)?;
    }
    std::fs::create_dir_all(target_dir)?;

    // Entries are stored under the snapshot's top-level directory name;
    // strip that component so the restore lands in `target_dir` whatever
    // it is called now.
    let file = File::open(backup_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry.map_err(|e| UpdateError::BackupCorrupted {
            path: backup_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let entry_path = entry.path()?.into_owned();
        let mut components = entry_path.components();
        components.next();
        let relative = components.as_path().to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target_dir.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }

    info!(target = %target_dir.display(), "backup restored");
    Ok(())
}
