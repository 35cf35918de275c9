//! Registry and pull tests against a mock Docker Registry v2 server.
//!
//! Run by default: `cargo test --test test_registry_pull`. No network or
//! privileges required; the live-registry counterparts live in the library's
//! `#[ignore]`d unit tests.

use std::io::Write;

use cask::{
    config::CaskConfig,
    oci::{self, DockerRegistry, Reference},
    CaskError,
};
use httpmock::prelude::*;
use sha2::{Digest, Sha256};

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

/// A minimal single-layer image: returns (gzipped layer bytes, compressed
/// digest hex, diff_id hex).
fn build_test_layer() -> (Vec<u8>, String, String) {
    let mut builder = tar::Builder::new(Vec::new());
    let content = b"hello from the test layer\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/greeting", content.as_slice())
        .unwrap();
    let tar_bytes = builder.into_inner().unwrap();

    let diff_id = hex::encode(Sha256::digest(&tar_bytes));

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    let gz_bytes = encoder.finish().unwrap();

    let compressed = hex::encode(Sha256::digest(&gz_bytes));
    (gz_bytes, compressed, diff_id)
}

fn image_config_json(diff_id: &str) -> serde_json::Value {
    serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": [format!("sha256:{}", diff_id)]
        },
        "config": {}
    })
}

fn index_json(manifest_digest: &str) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{}", manifest_digest),
                "size": 527,
                "platform": { "architecture": "arm64", "os": "linux" }
            },
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": format!("sha256:{}", manifest_digest),
                "size": 527,
                "platform": { "architecture": "amd64", "os": "linux" }
            }
        ]
    })
}

fn manifest_json(config_digest: &str, layer_digest: &str, layer_size: usize) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": format!("sha256:{}", config_digest),
            "size": 1469
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": format!("sha256:{}", layer_digest),
                "size": layer_size
            }
        ]
    })
}

/// Seeds a cached session so pulls skip the token handshake.
fn seed_session(config: &CaskConfig) {
    std::fs::create_dir_all(&config.home_dir).unwrap();
    std::fs::write(
        config.session_path(),
        serde_json::json!({ "token": "testtoken", "scheme": "Bearer" }).to_string(),
    )
    .unwrap();
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_is_idempotent_and_skips_blob_downloads() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().unwrap();

    let mut config = CaskConfig::with_home(home.path());
    config.registry_url = server.base_url();
    seed_session(&config);

    let (gz_bytes, compressed_digest, diff_id) = build_test_layer();
    let manifest_digest = "ab".repeat(32);

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2/library/testimg/manifests/latest")
                .header("authorization", "Bearer testtoken");
            then.status(200)
                .header(
                    "content-type",
                    "application/vnd.docker.distribution.manifest.list.v2+json",
                )
                .json_body(index_json(&manifest_digest));
        })
        .await;

    let config_digest = "cd".repeat(32);
    let manifest_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/library/testimg/manifests/sha256:{}", manifest_digest));
            then.status(200)
                .header(
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .json_body(manifest_json(&config_digest, &compressed_digest, gz_bytes.len()));
        })
        .await;

    let config_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/library/testimg/blobs/sha256:{}", config_digest));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(image_config_json(&diff_id));
        })
        .await;

    let blob_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(format!(
                "/v2/library/testimg/blobs/sha256:{}",
                compressed_digest
            ));
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(gz_bytes.clone());
        })
        .await;

    let reference: Reference = "testimg:latest".parse().unwrap();

    // First pull downloads and extracts the layer.
    let image_config = oci::pull_image(&config, &reference).await.unwrap();
    assert_eq!(image_config.rootfs().diff_ids().len(), 1);
    assert_eq!(blob_mock.hits_async().await, 1);

    let extracted = config.layer_dir().join(&diff_id);
    assert!(extracted.join("etc/greeting").is_file());
    let mtime_before = std::fs::metadata(&extracted).unwrap().modified().unwrap();

    // Manifests are persisted under the local registry directory.
    let manifests_dir = config.manifests_dir("testimg");
    for name in [
        "base_manifest.json",
        "arch_manifest.json",
        "config_manifest.json",
    ] {
        assert!(manifests_dir.join(name).is_file(), "{} missing", name);
    }

    // Second pull issues zero blob GETs and leaves the extraction untouched.
    oci::pull_image(&config, &reference).await.unwrap();
    assert_eq!(blob_mock.hits_async().await, 1);
    assert_eq!(
        std::fs::metadata(&extracted).unwrap().modified().unwrap(),
        mtime_before
    );

    assert!(index_mock.hits_async().await >= 1);
    assert!(manifest_mock.hits_async().await >= 1);
    assert!(config_mock.hits_async().await >= 1);
}

#[tokio::test]
async fn test_pull_rejects_corrupt_blob() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().unwrap();

    let mut config = CaskConfig::with_home(home.path());
    config.registry_url = server.base_url();
    seed_session(&config);

    let (gz_bytes, compressed_digest, diff_id) = build_test_layer();
    let manifest_digest = "ab".repeat(32);
    let config_digest = "cd".repeat(32);

    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/library/testimg/manifests/latest");
            then.status(200).json_body(index_json(&manifest_digest));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/library/testimg/manifests/sha256:{}", manifest_digest));
            then.status(200)
                .json_body(manifest_json(&config_digest, &compressed_digest, gz_bytes.len()));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/library/testimg/blobs/sha256:{}", config_digest));
            then.status(200).json_body(image_config_json(&diff_id));
        })
        .await;
    // The registry serves bytes that do not hash to the advertised digest.
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!(
                "/v2/library/testimg/blobs/sha256:{}",
                compressed_digest
            ));
            then.status(200).body(b"corrupted bytes".to_vec());
        })
        .await;

    let reference: Reference = "testimg:latest".parse().unwrap();
    let result = oci::pull_image(&config, &reference).await;

    assert!(matches!(result, Err(CaskError::BlobDigestMismatch { .. })));
    // Neither the blob nor an extraction may be committed.
    assert!(!config
        .blob_dir()
        .join(format!("sha256:{}", compressed_digest))
        .exists());
    assert!(!config.layer_dir().join(&diff_id).exists());
}

#[tokio::test]
async fn test_authenticate_caches_token_from_challenge() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().unwrap();

    let mut config = CaskConfig::with_home(home.path());
    config.registry_url = server.base_url();

    let challenge = server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/library/testimg/manifests/latest");
            then.status(401).header(
                "www-authenticate",
                format!(
                    "Bearer realm=\"{}\",service=\"registry.docker.io\",scope=\"repository:library/testimg:pull\"",
                    server.url("/token")
                ),
            );
        })
        .await;

    let token = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/token")
                .query_param("service", "registry.docker.io")
                .query_param("scope", "repository:library/testimg:pull");
            then.status(200)
                .json_body(serde_json::json!({ "token": "minted-token" }));
        })
        .await;

    let registry = DockerRegistry::new(&config);
    let session = registry
        .authenticate(&format!(
            "{}/v2/library/testimg/manifests/latest",
            server.base_url()
        ))
        .await
        .unwrap();

    assert_eq!(session.token, "minted-token");
    assert_eq!(session.scheme, "Bearer");
    assert_eq!(challenge.hits_async().await, 1);
    assert_eq!(token.hits_async().await, 1);

    // The session is cached on disk for later runs.
    let raw = std::fs::read_to_string(config.session_path()).unwrap();
    assert!(raw.contains("minted-token"));
}

#[tokio::test]
async fn test_persistent_401_reauthenticates_exactly_once() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().unwrap();

    let mut config = CaskConfig::with_home(home.path());
    config.registry_url = server.base_url();

    // The registry never accepts the token: every manifest GET is a 401
    // carrying a fresh challenge.
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/library/testimg/manifests/latest");
            then.status(401).header(
                "www-authenticate",
                format!(
                    "Bearer realm=\"{}\",service=\"registry.docker.io\",scope=\"repository:library/testimg:pull\"",
                    server.url("/token")
                ),
            );
        })
        .await;

    let token = server
        .mock_async(|when, then| {
            when.method(GET).path("/token");
            then.status(200)
                .json_body(serde_json::json!({ "token": "rejected-token" }));
        })
        .await;

    let reference: Reference = "testimg:latest".parse().unwrap();
    let registry = DockerRegistry::new(&config);
    let result = registry.resolve(&reference).await;

    assert!(matches!(
        result,
        Err(CaskError::RegistryRequest { status: 401, .. })
    ));
    // One eager authentication plus exactly one retry — never a loop.
    assert_eq!(token.hits_async().await, 2);
}
