//! Operator-facing error messaging
//!
//! A pure mapping from error codes to explanations and corrective actions.
//! Restore failures are the one class the engine cannot recover from by
//! itself, so their message always carries the public release URL for a
//! manual reinstall.

use crate::error::{ErrorCode, UpdateError};

/// Operator guidance for one error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guidance {
    /// What happened, in operator terms
    pub user_message: &'static str,
    /// The corrective step to take
    pub corrective_action: &'static str,
    /// Whether the rendered message must include the public release URL
    pub includes_registry_url: bool,
}

/// Look up the guidance for an error code
pub fn guidance_for(code: ErrorCode) -> Guidance {
    match code {
        ErrorCode::RegistryUnreachable => Guidance {
            user_message: "The release registry could not be reached.",
            corrective_action: "Check network connectivity and retry in a few minutes.",
            includes_registry_url: false,
        },
        ErrorCode::RegistryRateLimited => Guidance {
            user_message: "The release registry is throttling requests.",
            corrective_action: "Wait for the indicated period before retrying.",
            includes_registry_url: false,
        },
        ErrorCode::SizeMismatch => Guidance {
            user_message: "The downloaded package size does not match what the registry declared.",
            corrective_action: "The download was discarded; retry the update. If this persists, the release may be corrupted upstream.",
            includes_registry_url: false,
        },
        ErrorCode::InvalidFormat => Guidance {
            user_message: "The downloaded file is not a valid release archive.",
            corrective_action: "The download was discarded; retry the update.",
            includes_registry_url: false,
        },
        ErrorCode::EmptyArchive => Guidance {
            user_message: "The downloaded release archive contains no files.",
            corrective_action: "The download was discarded; report this release to the maintainers.",
            includes_registry_url: false,
        },
        ErrorCode::CorruptArchive => Guidance {
            user_message: "The downloaded release archive is corrupted.",
            corrective_action: "The download was discarded; retry the update.",
            includes_registry_url: false,
        },
        ErrorCode::BackupDirNotWritable => Guidance {
            user_message: "The backup directory cannot be written.",
            corrective_action: "Check write permissions on the backup directory and retry.",
            includes_registry_url: false,
        },
        ErrorCode::InsufficientDiskSpace => Guidance {
            user_message: "There is not enough free disk space to back up the current installation.",
            corrective_action: "Free disk space and retry.",
            includes_registry_url: false,
        },
        ErrorCode::SourceDirectoryMissing => Guidance {
            user_message: "The extracted release directory is missing.",
            corrective_action: "Retry the update; if this persists, check the temporary directory for interference.",
            includes_registry_url: false,
        },
        ErrorCode::InvalidStructure => Guidance {
            user_message: "The release package does not contain a valid unit.",
            corrective_action: "Report this release to the maintainers; the previous installation was kept.",
            includes_registry_url: false,
        },
        ErrorCode::UnrecognizedPattern => Guidance {
            user_message: "The release package uses a directory naming convention this engine does not recognize.",
            corrective_action: "Report the directory name to the maintainers so the convention can be added.",
            includes_registry_url: false,
        },
        ErrorCode::UpdateInProgress => Guidance {
            user_message: "Another update for this unit is already in progress.",
            corrective_action: "Wait for the running update to finish; stale locks expire on their own.",
            includes_registry_url: false,
        },
        ErrorCode::BackupNotFound => Guidance {
            user_message: "The update failed and the backup needed to roll back is missing.",
            corrective_action: "Reinstall the unit manually from the release registry.",
            includes_registry_url: true,
        },
        ErrorCode::BackupCorrupted => Guidance {
            user_message: "The update failed and the backup needed to roll back is unreadable.",
            corrective_action: "Reinstall the unit manually from the release registry. The backup file was kept for inspection.",
            includes_registry_url: true,
        },
        ErrorCode::RestoreTimeout => Guidance {
            user_message: "The update failed and restoring the backup did not finish in time.",
            corrective_action: "Reinstall the unit manually from the release registry. The backup file was kept.",
            includes_registry_url: true,
        },
        ErrorCode::VersionUnavailable => Guidance {
            user_message: "The requested version is not what the registry currently serves.",
            corrective_action: "Request the latest version, or wait for the registry to publish the one you asked for.",
            includes_registry_url: false,
        },
        ErrorCode::SessionNotFound => Guidance {
            user_message: "No update with that id is currently running.",
            corrective_action: "Check the update history for its outcome.",
            includes_registry_url: false,
        },
        ErrorCode::Config => Guidance {
            user_message: "The engine configuration is invalid.",
            corrective_action: "Fix the configuration file and retry.",
            includes_registry_url: false,
        },
        ErrorCode::Io | ErrorCode::Http | ErrorCode::Json | ErrorCode::Semver => Guidance {
            user_message: "An unexpected error interrupted the update.",
            corrective_action: "Check the log output for details and retry.",
            includes_registry_url: false,
        },
    }
}

/// Render the full operator message for an error: what happened, what to
/// do about it, and for unrecoverable restore failures, where to download
/// the release by hand.
pub fn operator_message(err: &UpdateError, registry_url: &str) -> String {
    let guidance = guidance_for(err.code());
    let mut message = format!("{} {}", guidance.user_message, corrective_with_detail(err, guidance));
    if guidance.includes_registry_url {
        message.push_str(&format!(" Download manually from: {registry_url}"));
    }
    message
}

/// Corrective action, with dynamic values spliced in where the static
/// template cannot carry them
fn corrective_with_detail(err: &UpdateError, guidance: Guidance) -> String {
    match err {
        UpdateError::InsufficientDiskSpace {
            required,
            available,
        } => {
            let needed_mb = required.saturating_sub(*available).div_ceil(1024 * 1024).max(1);
            format!("Free at least {needed_mb} MB and retry.")
        }
        UpdateError::SizeMismatch { expected, actual } => format!(
            "{} (declared {expected} bytes, received {actual} bytes)",
            guidance.corrective_action
        ),
        UpdateError::RegistryRateLimited {
            retry_after_secs: Some(secs),
        } => format!("Retry after {secs} seconds."),
        UpdateError::UpdateInProgress { holder, started_at } => format!(
            "{} (held by '{holder}' since {started_at})",
            guidance.corrective_action
        ),
        _ => guidance.corrective_action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_nonempty_guidance() {
        let codes = [
            ErrorCode::RegistryUnreachable,
            ErrorCode::RegistryRateLimited,
            ErrorCode::SizeMismatch,
            ErrorCode::InvalidFormat,
            ErrorCode::EmptyArchive,
            ErrorCode::CorruptArchive,
            ErrorCode::BackupDirNotWritable,
            ErrorCode::InsufficientDiskSpace,
            ErrorCode::SourceDirectoryMissing,
            ErrorCode::InvalidStructure,
            ErrorCode::UnrecognizedPattern,
            ErrorCode::UpdateInProgress,
            ErrorCode::BackupNotFound,
            ErrorCode::BackupCorrupted,
            ErrorCode::RestoreTimeout,
            ErrorCode::VersionUnavailable,
            ErrorCode::SessionNotFound,
            ErrorCode::Config,
            ErrorCode::Io,
        ];
        for code in codes {
            let g = guidance_for(code);
            assert!(!g.user_message.is_empty());
            assert!(!g.corrective_action.is_empty());
        }
    }

    #[test]
    fn restore_failures_carry_the_registry_url() {
        for code in [
            ErrorCode::BackupNotFound,
            ErrorCode::BackupCorrupted,
            ErrorCode::RestoreTimeout,
        ] {
            assert!(guidance_for(code).includes_registry_url);
        }

        let message = operator_message(
            &UpdateError::RestoreTimeout { budget_secs: 10 },
            "https://releases.example.com/unit",
        );
        assert!(message.contains("https://releases.example.com/unit"));
    }

    #[test]
    fn disk_space_message_names_the_shortfall() {
        let err = UpdateError::InsufficientDiskSpace {
            required: 12 * 1024 * 1024,
            available: 2 * 1024 * 1024,
        };
        let message = operator_message(&err, "https://releases.example.com");
        assert!(message.contains("Free at least 10 MB"), "{message}");
    }

    #[test]
    fn recoverable_errors_do_not_leak_the_url() {
        let message = operator_message(
            &UpdateError::EmptyArchive,
            "https://releases.example.com/unit",
        );
        assert!(!message.contains("https://releases.example.com/unit"));
    }
}
