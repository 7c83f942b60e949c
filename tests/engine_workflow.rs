//! Workspace-level workflow tests for the public engine API

use flate2::write::GzEncoder;
use flate2::Compression;
use upkeep_engine::{EngineConfig, Severity, TriggerLocation, UpdateEngine, UpdateStatus};

fn package_bytes(top_dir: &str, version: &str) -> Vec<u8> {
    let entries = [
        (format!("{top_dir}/unit.toml"), "name = \"unit\"".to_string()),
        (format!("{top_dir}/version.txt"), version.to_string()),
    ];
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (name, content) in &entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name.as_str(), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

async fn serve_release(server: &mut mockito::ServerGuard, version: &str, package: &[u8]) {
    server
        .mock("GET", "/releases/latest")
        .with_status(200)
        .with_body(
            serde_json::json!({
                "version": version,
                "download_url": format!("{}/packages/unit.tar.gz", server.url()),
                "size_bytes": package.len(),
                "notes": "",
                "published_at": "2026-02-01T00:00:00Z",
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/packages/unit.tar.gz")
        .with_status(200)
        .with_body(package.to_vec())
        .create_async()
        .await;
}

#[tokio::test]
async fn commit_suffixed_release_directories_install_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = root.path().join("units").join("unit");
    std::fs::create_dir_all(&install_dir).unwrap();
    std::fs::write(install_dir.join("version.txt"), "1.0.0").unwrap();
    std::fs::write(install_dir.join("unit.toml"), "name = \"unit\"").unwrap();

    let mut server = mockito::Server::new_async().await;
    // Source-forge style export: {owner}-{name}-{commit}.
    let package = package_bytes("acme-unit-0a1b2c3d", "2.0.0");
    serve_release(&mut server, "2.0.0", &package).await;

    let engine = UpdateEngine::new(EngineConfig::new("unit", &install_dir, server.url())).unwrap();
    let session = engine
        .run_update(None, TriggerLocation::BulkOperation, "batch")
        .await
        .unwrap();

    assert_eq!(session.status, UpdateStatus::Complete);
    assert_eq!(
        std::fs::read_to_string(install_dir.join("version.txt"))
            .unwrap()
            .trim(),
        "2.0.0"
    );
    // The commit-suffixed directory was renamed, not installed verbatim.
    assert!(install_dir.ends_with("unit"));
}

#[tokio::test]
async fn history_keeps_the_five_most_recent_attempts() {
    let root = tempfile::tempdir().unwrap();
    let install_dir = root.path().join("units").join("unit");
    std::fs::create_dir_all(&install_dir).unwrap();
    std::fs::write(install_dir.join("version.txt"), "1.0.0").unwrap();
    std::fs::write(install_dir.join("unit.toml"), "name = \"unit\"").unwrap();

    let mut server = mockito::Server::new_async().await;
    let package = package_bytes("unit-v2.0.0", "2.0.0");
    serve_release(&mut server, "2.0.0", &package).await;

    let engine = UpdateEngine::new(EngineConfig::new("unit", &install_dir, server.url())).unwrap();
    for _ in 0..6 {
        let session = engine
            .run_update(None, TriggerLocation::Scheduled, "scheduler")
            .await
            .unwrap();
        assert_eq!(session.status, UpdateStatus::Complete);
    }

    let history = engine.get_history(10);
    assert_eq!(history.len(), 5);
    assert!(history
        .iter()
        .all(|e| e.status == UpdateStatus::Complete && e.severity == Severity::Info));
}
