//! Error types for the update engine

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Comprehensive error type for update operations
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The release registry could not be reached
    #[error("release registry unreachable: {reason}")]
    RegistryUnreachable { reason: String },

    /// The release registry throttled the request
    #[error("release registry rate limited the request")]
    RegistryRateLimited { retry_after_secs: Option<u64> },

    /// Downloaded package size deviates more than the allowed tolerance
    /// from the registry-declared size
    #[error("package size mismatch: declared {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Downloaded file cannot be opened as a compressed archive
    #[error("package is not a valid compressed archive: {reason}")]
    InvalidFormat { reason: String },

    /// Archive opened fine but contains no entries
    #[error("package archive contains no entries")]
    EmptyArchive,

    /// Listing archive entries failed partway through
    #[error("package archive is corrupt: {reason}")]
    CorruptArchive { reason: String },

    /// Backup directory cannot be created or written
    #[error("backup directory {path} is not writable")]
    BackupDirNotWritable { path: PathBuf },

    /// Pre-flight space estimate exceeds available space
    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    /// Extracted directory does not exist
    #[error("extracted directory {path} does not exist")]
    SourceDirectoryMissing { path: PathBuf },

    /// Directory exists but lacks the unit's required structure
    #[error("directory {path} has invalid structure: {reason}")]
    InvalidStructure { path: PathBuf, reason: String },

    /// Extracted directory name matches none of the known naming conventions
    #[error("directory name '{name}' matches no known release naming convention")]
    UnrecognizedPattern { name: String },

    /// Another update holds the single-update lock
    #[error("an update is already in progress (held by '{holder}' since {started_at})")]
    UpdateInProgress {
        holder: String,
        started_at: DateTime<Utc>,
    },

    /// Backup archive missing at the recorded path
    #[error("backup archive not found at {path}")]
    BackupNotFound { path: PathBuf },

    /// Backup archive exists but fails the integrity check
    #[error("backup archive at {path} is corrupted: {reason}")]
    BackupCorrupted { path: PathBuf, reason: String },

    /// Restore exceeded its bounded time budget
    #[error("backup restore exceeded the {budget_secs}s time budget")]
    RestoreTimeout { budget_secs: u64 },

    /// A requested target version is not what the registry serves
    #[error("requested version {requested} is not available (registry serves {latest})")]
    VersionUnavailable {
        requested: semver::Version,
        latest: semver::Version,
    },

    /// No active session with the given id
    #[error("no active update session {0}")]
    SessionNotFound(Uuid),

    /// Engine configuration is invalid
    #[error("invalid engine configuration: {reason}")]
    Config { reason: String },

    /// I/O errors during file operations
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// HTTP transport errors
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// JSON parsing errors
    #[error("JSON parsing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Semver parsing errors
    #[error("version parsing error: {source}")]
    Semver {
        #[from]
        source: semver::Error,
    },
}

impl UpdateError {
    /// Create a new registry-unreachable error
    pub fn registry_unreachable<S: Into<String>>(reason: S) -> Self {
        Self::RegistryUnreachable {
            reason: reason.into(),
        }
    }

    /// Create a new invalid-format error
    pub fn invalid_format<S: Into<String>>(reason: S) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Create a new corrupt-archive error
    pub fn corrupt_archive<S: Into<String>>(reason: S) -> Self {
        Self::CorruptArchive {
            reason: reason.into(),
        }
    }

    /// Create a new invalid-structure error
    pub fn invalid_structure<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::InvalidStructure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(reason: S) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// The stable code identifying this error kind
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RegistryUnreachable { .. } => ErrorCode::RegistryUnreachable,
            Self::RegistryRateLimited { .. } => ErrorCode::RegistryRateLimited,
            Self::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            Self::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            Self::EmptyArchive => ErrorCode::EmptyArchive,
            Self::CorruptArchive { .. } => ErrorCode::CorruptArchive,
            Self::BackupDirNotWritable { .. } => ErrorCode::BackupDirNotWritable,
            Self::InsufficientDiskSpace { .. } => ErrorCode::InsufficientDiskSpace,
            Self::SourceDirectoryMissing { .. } => ErrorCode::SourceDirectoryMissing,
            Self::InvalidStructure { .. } => ErrorCode::InvalidStructure,
            Self::UnrecognizedPattern { .. } => ErrorCode::UnrecognizedPattern,
            Self::UpdateInProgress { .. } => ErrorCode::UpdateInProgress,
            Self::BackupNotFound { .. } => ErrorCode::BackupNotFound,
            Self::BackupCorrupted { .. } => ErrorCode::BackupCorrupted,
            Self::RestoreTimeout { .. } => ErrorCode::RestoreTimeout,
            Self::VersionUnavailable { .. } => ErrorCode::VersionUnavailable,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::Config { .. } => ErrorCode::Config,
            Self::Io { .. } => ErrorCode::Io,
            Self::Http { .. } => ErrorCode::Http,
            Self::Json { .. } => ErrorCode::Json,
            Self::Semver { .. } => ErrorCode::Semver,
        }
    }

    /// Structured context for this error, used when projecting it into an
    /// [`crate::models::UpdateSession`]
    pub fn context_map(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        match self {
            Self::SizeMismatch { expected, actual } => {
                ctx.insert("expected".into(), expected.to_string());
                ctx.insert("actual".into(), actual.to_string());
            }
            Self::InsufficientDiskSpace {
                required,
                available,
            } => {
                ctx.insert("required".into(), required.to_string());
                ctx.insert("available".into(), available.to_string());
            }
            Self::UpdateInProgress { holder, started_at } => {
                ctx.insert("holder".into(), holder.clone());
                ctx.insert("started_at".into(), started_at.to_rfc3339());
            }
            Self::RegistryRateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    ctx.insert("retry_after_secs".into(), secs.to_string());
                }
            }
            Self::RestoreTimeout { budget_secs } => {
                ctx.insert("budget_secs".into(), budget_secs.to_string());
            }
            Self::BackupDirNotWritable { path }
            | Self::SourceDirectoryMissing { path }
            | Self::BackupNotFound { path } => {
                ctx.insert("path".into(), path.display().to_string());
            }
            Self::InvalidStructure { path, .. } | Self::BackupCorrupted { path, .. } => {
                ctx.insert("path".into(), path.display().to_string());
            }
            Self::UnrecognizedPattern { name } => {
                ctx.insert("name".into(), name.clone());
            }
            Self::VersionUnavailable { requested, latest } => {
                ctx.insert("requested".into(), requested.to_string());
                ctx.insert("latest".into(), latest.to_string());
            }
            _ => {}
        }
        ctx
    }
}

/// Stable identifier for every error kind the engine can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RegistryUnreachable,
    RegistryRateLimited,
    SizeMismatch,
    InvalidFormat,
    EmptyArchive,
    CorruptArchive,
    BackupDirNotWritable,
    InsufficientDiskSpace,
    SourceDirectoryMissing,
    InvalidStructure,
    UnrecognizedPattern,
    UpdateInProgress,
    BackupNotFound,
    BackupCorrupted,
    RestoreTimeout,
    VersionUnavailable,
    SessionNotFound,
    Config,
    Io,
    Http,
    Json,
    Semver,
}

impl ErrorCode {
    /// Snake-case identifier used in session errors and history records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryUnreachable => "registry_unreachable",
            Self::RegistryRateLimited => "registry_rate_limited",
            Self::SizeMismatch => "size_mismatch",
            Self::InvalidFormat => "invalid_format",
            Self::EmptyArchive => "empty_archive",
            Self::CorruptArchive => "corrupt_archive",
            Self::BackupDirNotWritable => "backup_dir_not_writable",
            Self::InsufficientDiskSpace => "insufficient_disk_space",
            Self::SourceDirectoryMissing => "source_directory_missing",
            Self::InvalidStructure => "invalid_structure",
            Self::UnrecognizedPattern => "unrecognized_pattern",
            Self::UpdateInProgress => "update_in_progress",
            Self::BackupNotFound => "backup_not_found",
            Self::BackupCorrupted => "backup_corrupted",
            Self::RestoreTimeout => "restore_timeout",
            Self::VersionUnavailable => "version_unavailable",
            Self::SessionNotFound => "session_not_found",
            Self::Config => "config",
            Self::Io => "io",
            Self::Http => "http",
            Self::Json => "json",
            Self::Semver => "semver",
        }
    }

    /// Whether this code belongs to the restore path, where any failure
    /// leaves the installation in need of manual recovery
    pub fn is_restore_failure(&self) -> bool {
        matches!(
            self,
            Self::BackupNotFound | Self::BackupCorrupted | Self::RestoreTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
