//! Release package download

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::error::{Result, UpdateError};
use crate::models::ReleaseInfo;

/// Suffix identifying package files written by this engine.
///
/// The orphan sweep only ever deletes files carrying this suffix, so
/// foreign files sharing the download directory are left alone.
pub const DOWNLOAD_SUFFIX: &str = ".upkeep.tar.gz";

/// File name a release package is stored under in the download directory
pub fn download_file_name(unit_name: &str, version: &semver::Version) -> String {
    format!("{unit_name}-{version}{DOWNLOAD_SUFFIX}")
}

/// Fetches release package bytes onto the local disk.
///
/// Kept behind a trait so tests and embedding hosts can substitute their
/// own transfer mechanism.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Download the package for `release`, writing it into `download_dir`
    /// under the engine's naming scheme. Returns the written path.
    async fn fetch(
        &self,
        unit_name: &str,
        release: &ReleaseInfo,
        download_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Default fetcher: plain HTTPS GET of the registry's download URL
pub struct HttpPackageFetcher {
    client: Client,
}

impl HttpPackageFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("upkeep-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for HttpPackageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageFetcher for HttpPackageFetcher {
    async fn fetch(
        &self,
        unit_name: &str,
        release: &ReleaseInfo,
        download_dir: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(download_dir).await?;

        let response = self
            .client
            .get(&release.download_url)
            .send()
            .await
            .map_err(|e| {
                warn!("package download failed: {e}");
                UpdateError::registry_unreachable(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(UpdateError::registry_unreachable(format!(
                "download returned HTTP {} for {}",
                response.status(),
                release.download_url
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::registry_unreachable(e.to_string()))?;

        let dest = download_dir.join(download_file_name(unit_name, &release.version));
        tokio::fs::write(&dest, &bytes).await?;
        info!(
            path = %dest.display(),
            bytes = bytes.len(),
            "downloaded release package"
        );
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn release(url: String, size: u64) -> ReleaseInfo {
        ReleaseInfo {
            version: semver::Version::new(1, 2, 3),
            download_url: url,
            size_bytes: size,
            notes: String::new(),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn download_names_are_engine_tagged() {
        let name = download_file_name("unit", &semver::Version::new(1, 2, 3));
        assert_eq!(name, "unit-1.2.3.upkeep.tar.gz");
        assert!(name.ends_with(DOWNLOAD_SUFFIX));
    }

    #[tokio::test]
    async fn fetches_package_to_download_dir() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/pkg.tar.gz")
            .with_status(200)
            .with_body(b"package-bytes".to_vec())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpPackageFetcher::new();
        let path = fetcher
            .fetch(
                "unit",
                &release(format!("{}/pkg.tar.gz", server.url()), 13),
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"package-bytes");
        assert!(path.ends_with("unit-1.2.3.upkeep.tar.gz"));
    }

    #[tokio::test]
    async fn missing_package_maps_to_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/pkg.tar.gz")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpPackageFetcher::new();
        let result = fetcher
            .fetch(
                "unit",
                &release(format!("{}/pkg.tar.gz", server.url()), 13),
                dir.path(),
            )
            .await;
        assert!(matches!(
            result,
            Err(UpdateError::RegistryUnreachable { .. })
        ));
    }
}
