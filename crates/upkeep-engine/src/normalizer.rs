//! Extracted directory name normalization
//!
//! Release sources name the extracted top-level directory after their own
//! conventions (version-suffixed, commit-suffixed, branch-suffixed). The
//! host expects one exact directory name, so the normalizer reconciles the
//! two from a closed table of recognized patterns. Unrecognized names are
//! a hard error, never a guess.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, UpdateError};

const SEMVER_FRAGMENT: &str = r"\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?";

/// A recognized naming convention for an extracted release directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryPattern {
    /// Already the expected name
    Exact,
    /// `name-v1.2.3` or `name-1.2.3`
    VersionSuffixed,
    /// `owner-name-0a1b2c3` (source-forge export convention)
    CommitSuffixed,
    /// `name-branchname`
    BranchSuffixed,
}

/// Renames extracted release directories to the exact name the host
/// expects
#[derive(Debug, Clone)]
pub struct DirectoryNormalizer {
    entry_point: String,
}

impl DirectoryNormalizer {
    /// Create a normalizer that requires `entry_point` to exist inside a
    /// valid unit directory
    pub fn new<S: Into<String>>(entry_point: S) -> Self {
        Self {
            entry_point: entry_point.into(),
        }
    }

    /// Match a directory basename against the known conventions for
    /// `expected_name`
    pub fn match_pattern(&self, name: &str, expected_name: &str) -> Option<DirectoryPattern> {
        if name == expected_name {
            return Some(DirectoryPattern::Exact);
        }
        let escaped = regex::escape(expected_name);

        let version = Regex::new(&format!("^{escaped}-v?{SEMVER_FRAGMENT}$"))
            .expect("version pattern is valid");
        if version.is_match(name) {
            return Some(DirectoryPattern::VersionSuffixed);
        }

        let commit = Regex::new(&format!("^[A-Za-z0-9_.]+-{escaped}-[0-9a-f]{{7,40}}$"))
            .expect("commit pattern is valid");
        if commit.is_match(name) {
            return Some(DirectoryPattern::CommitSuffixed);
        }

        let branch = Regex::new(&format!("^{escaped}-[A-Za-z0-9._-]+$"))
            .expect("branch pattern is valid");
        if branch.is_match(name) {
            return Some(DirectoryPattern::BranchSuffixed);
        }

        None
    }

    /// Rename `extracted_dir` to `expected_name` inside `parent_dir`.
    ///
    /// Idempotent: a directory already carrying the expected name passes
    /// through unchanged, so the call is safe to make speculatively. A
    /// stale target directory left by a previous failed attempt is
    /// replaced.
    pub fn normalize(
        &self,
        extracted_dir: &Path,
        parent_dir: &Path,
        expected_name: &str,
    ) -> Result<PathBuf> {
        if !extracted_dir.is_dir() {
            return Err(UpdateError::SourceDirectoryMissing {
                path: extracted_dir.to_path_buf(),
            });
        }

        if !extracted_dir.join(&self.entry_point).is_file() {
            return Err(UpdateError::invalid_structure(
                extracted_dir,
                format!("missing entry point {}", self.entry_point),
            ));
        }

        let name = extracted_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UpdateError::SourceDirectoryMissing {
                path: extracted_dir.to_path_buf(),
            })?;

        let pattern = self
            .match_pattern(name, expected_name)
            .ok_or_else(|| UpdateError::UnrecognizedPattern { name: name.into() })?;

        let target = parent_dir.join(expected_name);
        if pattern == DirectoryPattern::Exact && extracted_dir == target {
            debug!(path = %target.display(), "directory already normalized");
            return Ok(target);
        }

        if target.exists() {
            // Stale directory from a previous failed attempt.
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(extracted_dir, &target)?;
        info!(
            from = name,
            to = expected_name,
            pattern = ?pattern,
            "normalized extracted directory"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unit_dir(parent: &Path, name: &str) -> PathBuf {
        let dir = parent.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("unit.toml"), "name = \"unit\"").unwrap();
        dir
    }

    #[test]
    fn known_conventions_all_normalize() {
        let normalizer = DirectoryNormalizer::new("unit.toml");
        for name in [
            "unit-v1.2.3",
            "unit-1.2.3",
            "owner-unit-abc1234",
            "unit-branchname",
            "unit",
        ] {
            let temp = tempfile::tempdir().unwrap();
            let extracted = make_unit_dir(temp.path(), name);
            let result = normalizer
                .normalize(&extracted, temp.path(), "unit")
                .unwrap();
            assert_eq!(result, temp.path().join("unit"), "failed for {name}");
            assert!(result.join("unit.toml").is_file());
        }
    }

    #[test]
    fn unknown_convention_is_a_hard_error() {
        let temp = tempfile::tempdir().unwrap();
        let extracted = make_unit_dir(temp.path(), "totally-different-name");

        let normalizer = DirectoryNormalizer::new("unit.toml");
        match normalizer.normalize(&extracted, temp.path(), "unit") {
            Err(UpdateError::UnrecognizedPattern { name }) => {
                assert_eq!(name, "totally-different-name");
            }
            other => panic!("expected UnrecognizedPattern, got {other:?}"),
        }
        // No silent rename happened.
        assert!(extracted.is_dir());
        assert!(!temp.path().join("unit").exists());
    }

    #[test]
    fn missing_source_directory() {
        let temp = tempfile::tempdir().unwrap();
        let normalizer = DirectoryNormalizer::new("unit.toml");
        let result = normalizer.normalize(&temp.path().join("ghost"), temp.path(), "unit");
        assert!(matches!(
            result,
            Err(UpdateError::SourceDirectoryMissing { .. })
        ));
    }

    #[test]
    fn missing_entry_point_is_invalid_structure() {
        let temp = tempfile::tempdir().unwrap();
        let extracted = temp.path().join("unit-v1.2.3");
        std::fs::create_dir_all(&extracted).unwrap();

        let normalizer = DirectoryNormalizer::new("unit.toml");
        assert!(matches!(
            normalizer.normalize(&extracted, temp.path(), "unit"),
            Err(UpdateError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn stale_target_from_failed_attempt_is_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let stale = make_unit_dir(temp.path(), "unit");
        std::fs::write(stale.join("stale.marker"), "old").unwrap();
        let extracted = make_unit_dir(temp.path(), "unit-v2.0.0");

        let normalizer = DirectoryNormalizer::new("unit.toml");
        let result = normalizer
            .normalize(&extracted, temp.path(), "unit")
            .unwrap();
        assert!(!result.join("stale.marker").exists());
        assert!(result.join("unit.toml").is_file());
    }

    #[test]
    fn normalize_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let dir = make_unit_dir(temp.path(), "unit");
        std::fs::write(dir.join("data.txt"), "payload").unwrap();

        let normalizer = DirectoryNormalizer::new("unit.toml");
        let first = normalizer.normalize(&dir, temp.path(), "unit").unwrap();
        let second = normalizer.normalize(&first, temp.path(), "unit").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(second.join("data.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn pattern_classification() {
        let normalizer = DirectoryNormalizer::new("unit.toml");
        assert_eq!(
            normalizer.match_pattern("unit", "unit"),
            Some(DirectoryPattern::Exact)
        );
        assert_eq!(
            normalizer.match_pattern("unit-v1.2.3", "unit"),
            Some(DirectoryPattern::VersionSuffixed)
        );
        assert_eq!(
            normalizer.match_pattern("unit-1.2.3-beta.1", "unit"),
            Some(DirectoryPattern::VersionSuffixed)
        );
        assert_eq!(
            normalizer.match_pattern("acme-unit-deadbeef", "unit"),
            Some(DirectoryPattern::CommitSuffixed)
        );
        assert_eq!(
            normalizer.match_pattern("unit-main", "unit"),
            Some(DirectoryPattern::BranchSuffixed)
        );
        assert_eq!(normalizer.match_pattern("other-unit", "unit"), None);
        assert_eq!(normalizer.match_pattern("unitx", "unit"), None);
    }
}
