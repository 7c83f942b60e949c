//! Release resolution against the remote release registry

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, UpdateError};
use crate::models::{ReleaseInfo, UpdateCheck};

/// Payload shape served by `GET {registry}/releases/latest`
#[derive(Debug, Deserialize)]
struct RegistryRelease {
    /// Version string, with or without a leading `v`
    version: String,
    download_url: String,
    size_bytes: u64,
    #[serde(default)]
    notes: String,
    published_at: DateTime<Utc>,
}

struct CachedRelease {
    release: ReleaseInfo,
    fetched_at: Instant,
}

/// Queries the release registry for the latest version and caches the
/// answer for a bounded TTL.
///
/// Network failures are reported, never retried here; retry policy belongs
/// to the caller.
#[derive(Clone)]
pub struct ReleaseResolver {
    client: Client,
    registry_url: String,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<CachedRelease>>>,
}

impl ReleaseResolver {
    /// Create a resolver for the given registry base URL
    pub fn new(registry_url: String, cache_ttl: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("upkeep-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            registry_url,
            cache_ttl,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Resolve the latest available release.
    ///
    /// Serves a cached answer while it is fresh unless `force` is set.
    pub async fn resolve(&self, force: bool) -> Result<ReleaseInfo> {
        if !force {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.fetched_at.elapsed() <= self.cache_ttl {
                    debug!("serving release info from cache");
                    return Ok(cached.release.clone());
                }
            }
        }

        let release = self.fetch_latest().await?;
        info!(version = %release.version, "resolved latest release");

        *self.cache.write().await = Some(CachedRelease {
            release: release.clone(),
            fetched_at: Instant::now(),
        });
        Ok(release)
    }

    /// Compare the installed version against the latest release
    pub async fn check_for_update(
        &self,
        current_version: &semver::Version,
        force: bool,
    ) -> Result<UpdateCheck> {
        let release = self.resolve(force).await?;
        Ok(UpdateCheck {
            update_available: release.version > *current_version,
            current_version: current_version.clone(),
            latest_version: release.version.clone(),
            release,
            checked_at: Utc::now(),
        })
    }

    async fn fetch_latest(&self) -> Result<ReleaseInfo> {
        let url = format!("{}/releases/latest", self.registry_url.trim_end_matches('/'));

        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!("release registry request failed: {e}");
            UpdateError::registry_unreachable(e.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(UpdateError::RegistryRateLimited { retry_after_secs });
        }
        if !status.is_success() {
            return Err(UpdateError::registry_unreachable(format!(
                "registry returned HTTP {status} for {url}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::registry_unreachable(e.to_string()))?;
        let wire: RegistryRelease = serde_json::from_str(&body)?;

        let version =
            semver::Version::parse(wire.version.strip_prefix('v').unwrap_or(wire.version.as_str()))?;
        Ok(ReleaseInfo {
            version,
            download_url: wire.download_url,
            size_bytes: wire.size_bytes,
            notes: wire.notes,
            published_at: wire.published_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release_body(version: &str, size: u64) -> String {
        serde_json::json!({
            "version": version,
            "download_url": "https://releases.example.com/unit.tar.gz",
            "size_bytes": size,
            "notes": "fixes",
            "published_at": "2026-01-15T10:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn resolves_latest_release() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/releases/latest")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(release_body("v3.17.0", 5_242_880))
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        let release = resolver.resolve(false).await.unwrap();
        assert_eq!(release.version, semver::Version::new(3, 17, 0));
        assert_eq!(release.size_bytes, 5_242_880);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/releases/latest")
            .with_status(200)
            .with_body(release_body("1.2.3", 1000))
            .expect(1)
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        resolver.resolve(false).await.unwrap();
        resolver.resolve(false).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn force_bypasses_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/releases/latest")
            .with_status(200)
            .with_body(release_body("1.2.3", 1000))
            .expect(2)
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        resolver.resolve(false).await.unwrap();
        resolver.resolve(true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn throttling_maps_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/releases/latest")
            .with_status(429)
            .with_header("retry-after", "120")
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        match resolver.resolve(false).await {
            Err(UpdateError::RegistryRateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, Some(120));
            }
            other => panic!("expected RegistryRateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_maps_to_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/releases/latest")
            .with_status(503)
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        assert!(matches!(
            resolver.resolve(false).await,
            Err(UpdateError::RegistryUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn check_reports_availability() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/releases/latest")
            .with_status(200)
            .with_body(release_body("2.0.0", 1000))
            .create_async()
            .await;

        let resolver = ReleaseResolver::new(server.url(), Duration::from_secs(60));
        let check = resolver
            .check_for_update(&semver::Version::new(1, 9, 0), false)
            .await
            .unwrap();
        assert!(check.update_available);

        let check = resolver
            .check_for_update(&semver::Version::new(2, 0, 0), false)
            .await
            .unwrap();
        assert!(!check.update_available);
    }
}
