//! Downloaded package validation

use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{info, warn};

use crate::error::{Result, UpdateError};
use crate::fetcher::DOWNLOAD_SUFFIX;

/// Validates downloaded release packages before anything destructive
/// happens, and keeps the download directory free of rejected or
/// forgotten files.
#[derive(Debug, Clone)]
pub struct DownloadValidator {
    tolerance: f64,
}

impl DownloadValidator {
    /// Create a validator with the given relative size tolerance
    /// (e.g. `0.05` for ±5 %)
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Check the package's on-disk size against the registry-declared size.
    ///
    /// The tolerance absorbs compression and metadata variance between what
    /// the registry reports and what actually transfers. The boundary is
    /// inclusive: a deviation of exactly the tolerance passes.
    pub fn validate_size(&self, path: &Path, expected_size: u64) -> Result<()> {
        let actual = std::fs::metadata(path)?.len();
        if within_tolerance(actual, expected_size, self.tolerance) {
            Ok(())
        } else {
            Err(UpdateError::SizeMismatch {
                expected: expected_size,
                actual,
            })
        }
    }

    /// Check that the package opens as a gzip-compressed tar archive with
    /// at least one listable entry.
    pub fn validate_archive(&self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let mut archive = Archive::new(GzDecoder::new(file));

        let entries = archive
            .entries()
            .map_err(|e| UpdateError::invalid_format(e.to_string()))?;

        let mut count = 0usize;
        for entry in entries {
            match entry {
                Ok(_) => count += 1,
                // The very first read pulls the gzip/tar headers, so a
                // failure before any entry means the file is not an
                // archive at all.
                Err(e) if count == 0 => {
                    return Err(UpdateError::invalid_format(e.to_string()));
                }
                Err(e) => {
                    return Err(UpdateError::corrupt_archive(e.to_string()));
                }
            }
        }

        if count == 0 {
            return Err(UpdateError::EmptyArchive);
        }
        Ok(())
    }

    /// Delete a rejected download. Best effort; a rejected package is
    /// never left on disk.
    pub fn cleanup_invalid(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "removed rejected download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "failed to remove rejected download: {e}"),
        }
    }

    /// Delete engine-owned packages in `download_dir` older than `max_age`.
    ///
    /// Only files carrying the engine's download suffix are considered;
    /// anything else in the directory is ignored. Returns the number of
    /// files removed.
    pub fn cleanup_orphans(&self, download_dir: &Path, max_age: Duration) -> Result<usize> {
        if !download_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for entry in std::fs::read_dir(download_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(DOWNLOAD_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!(path = %entry.path().display(), "removed orphaned download");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %entry.path().display(), "failed to remove orphan: {e}")
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Whether `actual` deviates from `expected` by at most `tolerance`
/// (relative, boundary inclusive)
fn within_tolerance(actual: u64, expected: u64, tolerance: f64) -> bool {
    if expected == 0 {
        return actual == 0;
    }
    let deviation = (actual as f64 - expected as f64).abs() / expected as f64;
    deviation <= tolerance
}
