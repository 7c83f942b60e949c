//! Core data models for the update engine

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UpdateError;

/// Latest release information served by the remote release registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release version
    pub version: semver::Version,
    /// Direct download URL for the release package
    pub download_url: String,
    /// Declared package size in bytes
    pub size_bytes: u64,
    /// Release notes
    pub notes: String,
    /// Publication timestamp
    pub published_at: DateTime<Utc>,
}

/// Result of comparing the installed version against the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheck {
    /// Whether a newer version is available
    pub update_available: bool,
    /// Currently installed version
    pub current_version: semver::Version,
    /// Latest version served by the registry
    pub latest_version: semver::Version,
    /// Release information for the latest version
    pub release: ReleaseInfo,
    /// When the check was performed
    pub checked_at: DateTime<Utc>,
}

/// Origin of an update request, supplied explicitly by the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerLocation {
    /// Interactive host UI
    InteractiveUi,
    /// Command-line invocation
    CommandLine,
    /// Scheduled run
    Scheduled,
    /// Part of a bulk operation
    BulkOperation,
}

impl std::fmt::Display for TriggerLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InteractiveUi => "interactive_ui",
            Self::CommandLine => "command_line",
            Self::Scheduled => "scheduled",
            Self::BulkOperation => "bulk_operation",
        };
        f.pad(s)
    }
}

/// State of an update session as the orchestrator advances it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Resolving the target release
    Checking,
    /// Fetching the release package
    Downloading,
    /// Validating size and archive integrity
    Validating,
    /// Snapshotting the current installation
    BackingUp,
    /// Unpacking the release package
    Extracting,
    /// Renaming the extracted directory to the expected name
    Normalizing,
    /// Replacing the installation directory
    Installing,
    /// Confirming the installed unit is intact
    Verifying,
    /// Update finished and verified
    Complete,
    /// Update failed without touching the installation
    Failed,
    /// Update failed and the previous installation was restored
    RolledBack,
}

impl UpdateStatus {
    /// Whether this status ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::RolledBack)
    }

    /// Snake-case name used in logs and history records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::BackingUp => "backing_up",
            Self::Extracting => "extracting",
            Self::Normalizing => "normalizing",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Structured error projection stored on a failed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionError {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Structured context (failing phase, expected/actual values, paths)
    pub context: HashMap<String, String>,
}

impl SessionError {
    /// Project an [`UpdateError`] into its session representation,
    /// recording the phase the failure occurred in
    pub fn from_error(err: &UpdateError, phase: UpdateStatus) -> Self {
        let mut context = err.context_map();
        context.insert("phase".into(), phase.as_str().into());
        Self {
            code: err.code().as_str().into(),
            message: err.to_string(),
            context,
        }
    }

    /// Attach an extra context entry
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// One attempt to update the installed unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSession {
    /// Unique id for this attempt
    pub id: Uuid,
    /// Version installed when the attempt started
    pub current_version: semver::Version,
    /// Version the attempt is moving to
    pub target_version: semver::Version,
    /// Where the request came from
    pub trigger_location: TriggerLocation,
    /// User or process identity that requested the update
    pub actor: String,
    /// Current state
    pub status: UpdateStatus,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Structured error if the attempt failed
    pub error: Option<SessionError>,
}

impl UpdateSession {
    /// Create a session in its initial state
    pub fn new(
        current_version: semver::Version,
        target_version: semver::Version,
        trigger_location: TriggerLocation,
        actor: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            current_version,
            target_version,
            trigger_location,
            actor,
            status: UpdateStatus::Checking,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Whether the failure, if any, requires manual recovery
    pub fn requires_manual_recovery(&self) -> bool {
        self.status == UpdateStatus::Failed
            && self
                .error
                .as_ref()
                .map(|e| e.context.get("phase").map(String::as_str) == Some("restore"))
                .unwrap_or(false)
    }
}

/// Severity of a history record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Successful update
    Info,
    /// Failure before any destructive step
    Warning,
    /// Failure that was rolled back cleanly
    Error,
    /// Restore failure or other data-loss risk
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.pad(s)
    }
}

/// Point-in-time snapshot of the installation directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArchive {
    /// Version the snapshot was taken from
    pub source_version: semver::Version,
    /// Path of the archive file
    pub file_path: std::path::PathBuf,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Archive size in bytes
    pub size_bytes: u64,
}

/// Immutable audit record of one update attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the attempt ended
    pub timestamp: DateTime<Utc>,
    /// Where the request came from
    pub trigger_location: TriggerLocation,
    /// Version the attempt targeted
    pub target_version: semver::Version,
    /// Terminal status of the attempt
    pub status: UpdateStatus,
    /// User or process identity
    pub actor: String,
    /// Error message if the attempt failed
    pub error_message: Option<String>,
    /// Assigned severity
    pub severity: Severity,
}
