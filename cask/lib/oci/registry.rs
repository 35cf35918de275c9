use std::path::{Path, PathBuf};

use futures::StreamExt;
use oci_spec::image::{
    Arch, Descriptor, Digest, DigestAlgorithm, ImageConfiguration, ImageIndex, ImageManifest, Os,
};
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE},
    Client, StatusCode,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    config::CaskConfig,
    oci::Reference,
    utils::{
        self, ARCH_MANIFEST_FILENAME, BASE_MANIFEST_FILENAME, CONFIG_MANIFEST_FILENAME,
    },
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type for Docker Registry v2 manifests.
const DOCKER_MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type for Docker Registry v2 manifest lists.
const DOCKER_MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type for Docker Registry v2 image layer blobs.
const DOCKER_IMAGE_BLOB_MIME_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The MIME type for Docker Registry v2 configuration blobs.
const DOCKER_CONFIG_MIME_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// The annotation key used to identify attestation manifests in a manifest list.
const DOCKER_REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for the Docker Registry HTTP API v2.
///
/// Handles the bearer-token authentication flow, manifest retrieval for the
/// linux/amd64 platform, and streaming blob downloads into the local blob
/// store.
///
/// [See Docker Registry API for details][Docker Registry API]
///
/// [Docker Registry API]: https://distribution.github.io/distribution/spec/api/#introduction
#[derive(Debug)]
pub struct DockerRegistry {
    /// The HTTP client used to make requests to the registry.
    client: ClientWithMiddleware,

    /// The runtime configuration (registry URL, store paths).
    config: CaskConfig,
}

/// A parsed `WWW-Authenticate` bearer challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The authentication scheme, normally `Bearer`.
    pub scheme: String,

    /// The token endpoint URL.
    pub realm: String,

    /// The service parameter to pass to the token endpoint.
    pub service: Option<String>,

    /// The scope parameter to pass to the token endpoint.
    pub scope: Option<String>,
}

/// Cached registry credentials, persisted as JSON in the session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// The token presented in the Authorization header.
    pub token: String,

    /// The authorization scheme the token goes with.
    pub scheme: String,
}

/// The response of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,

    #[serde(default)]
    access_token: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerRegistry {
    /// Creates a new registry client from the runtime configuration.
    pub fn new(config: &CaskConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            config: config.clone(),
        }
    }

    /// Resolves an image reference to its platform manifest and image
    /// configuration, persisting all three manifest documents under the local
    /// registry directory.
    ///
    /// Steps: fetch the manifest list, select the linux/amd64 entry, fetch the
    /// referenced manifest, then fetch the referenced configuration blob.
    pub async fn resolve(
        &self,
        reference: &Reference,
    ) -> CaskResult<(ImageManifest, ImageConfiguration)> {
        let repository = reference.repository();
        let list_url = self.manifest_url(&repository, reference.tag());
        let manifests_dir = self.config.manifests_dir(reference.name());

        let list_accept = format!(
            "{}, {}",
            DOCKER_MANIFEST_MIME_TYPE, DOCKER_MANIFEST_LIST_MIME_TYPE
        );
        let index: ImageIndex = self.fetch_json(&list_url, &list_accept, &list_url).await?;
        persist_manifest(&manifests_dir.join(BASE_MANIFEST_FILENAME), &index).await?;

        let descriptor = select_platform_manifest(&index)?;
        tracing::debug!(digest = %descriptor.digest(), "selected linux/amd64 manifest");

        let manifest: ImageManifest = self
            .fetch_json(
                &self.manifest_url(&repository, &descriptor.digest().to_string()),
                DOCKER_MANIFEST_MIME_TYPE,
                &list_url,
            )
            .await?;
        persist_manifest(&manifests_dir.join(ARCH_MANIFEST_FILENAME), &manifest).await?;

        let config: ImageConfiguration = self
            .fetch_json(
                &self.blob_url(&repository, manifest.config().digest()),
                DOCKER_CONFIG_MIME_TYPE,
                &list_url,
            )
            .await?;
        persist_manifest(&manifests_dir.join(CONFIG_MANIFEST_FILENAME), &config).await?;

        Ok((manifest, config))
    }

    /// Downloads a layer blob into the blob store, streaming it to disk.
    ///
    /// Idempotent: when a file named by the digest already exists the download
    /// is skipped entirely, without network I/O. Downloaded bytes are verified
    /// against the digest before the blob is committed to its final name.
    pub async fn download_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> CaskResult<PathBuf> {
        let blob_path = self.config.blob_dir().join(digest.to_string());
        if blob_path.exists() {
            tracing::info!(%digest, "blob already exists, skipping download");
            return Ok(blob_path);
        }

        let repository = reference.repository();
        let challenge_url = self.manifest_url(&repository, reference.tag());
        let url = self.blob_url(&repository, digest);
        tracing::info!(%digest, "downloading blob");

        fs::create_dir_all(self.config.blob_dir()).await?;
        let partial_path = self.config.blob_dir().join(format!("{}.partial", digest));

        let response = self
            .get_with_auth(&url, DOCKER_IMAGE_BLOB_MIME_TYPE, &challenge_url)
            .await?;

        let mut file = fs::File::create(&partial_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        drop(file);

        // Commit only bytes that hash to the advertised digest.
        let computed = utils::file_sha256_hex(&partial_path).await?;
        if *digest.algorithm() == DigestAlgorithm::Sha256 && computed != digest.digest() {
            fs::remove_file(&partial_path).await?;
            return Err(CaskError::BlobDigestMismatch {
                expected: digest.to_string(),
                computed,
            });
        }

        fs::rename(&partial_path, &blob_path).await?;
        Ok(blob_path)
    }

    /// Performs the token handshake: GET the challenge URL unauthenticated,
    /// parse the `WWW-Authenticate` header from the 401, then GET the realm
    /// with the advertised service and scope. The resulting session is cached
    /// in the session file.
    pub async fn authenticate(&self, challenge_url: &str) -> CaskResult<Session> {
        let response = self.client.get(challenge_url).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(CaskError::RegistryAuth(format!(
                "expected 401 challenge from {}, got {}",
                challenge_url,
                response.status()
            )));
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                CaskError::RegistryAuth("401 response carried no WWW-Authenticate header".into())
            })?;
        let challenge = parse_www_authenticate(header)?;

        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = challenge.service.as_deref() {
            params.push(("service", service));
        }
        if let Some(scope) = challenge.scope.as_deref() {
            params.push(("scope", scope));
        }

        let token_response = self
            .client
            .get(&challenge.realm)
            .query(&params)
            .send()
            .await?;
        if !token_response.status().is_success() {
            return Err(CaskError::RegistryAuth(format!(
                "token endpoint {} returned {}",
                challenge.realm,
                token_response.status()
            )));
        }

        let token: TokenResponse = token_response.json().await?;
        let token = if token.token.is_empty() {
            token.access_token
        } else {
            token.token
        };
        if token.is_empty() {
            return Err(CaskError::RegistryAuth(
                "token endpoint returned no token".into(),
            ));
        }

        let session = Session {
            token,
            scheme: challenge.scheme,
        };
        self.save_session(&session).await?;

        Ok(session)
    }

    /// Returns the cached session, authenticating first when there is none or
    /// when `force` is set.
    async fn session(&self, challenge_url: &str, force: bool) -> CaskResult<Session> {
        if !force {
            if let Ok(raw) = fs::read(self.config.session_path()).await {
                if let Ok(session) = serde_json::from_slice::<Session>(&raw) {
                    return Ok(session);
                }
            }
        }
        self.authenticate(challenge_url).await
    }

    async fn save_session(&self, session: &Session) -> CaskResult<()> {
        if let Some(parent) = self.config.session_path().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(self.config.session_path(), serde_json::to_vec(session)?).await?;
        Ok(())
    }

    /// Issues an authenticated GET, re-authenticating exactly once on 401.
    async fn get_with_auth(
        &self,
        url: &str,
        accept: &str,
        challenge_url: &str,
    ) -> CaskResult<reqwest::Response> {
        let mut session = self.session(challenge_url, false).await?;

        for attempt in 0..2 {
            let response = self
                .client
                .get(url)
                .header(ACCEPT, accept)
                .header(
                    AUTHORIZATION,
                    format!("{} {}", session.scheme, session.token),
                )
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                tracing::warn!(url, "registry returned 401, re-authenticating");
                session = self.session(challenge_url, true).await?;
                continue;
            }
            return Err(CaskError::RegistryRequest {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        unreachable!("authenticated GET loops at most twice")
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        accept: &str,
        challenge_url: &str,
    ) -> CaskResult<T> {
        let response = self.get_with_auth(url, accept, challenge_url).await?;
        Ok(response.json::<T>().await?)
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repository, reference
        )
    }

    fn blob_url(&self, repository: &str, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.config.registry_url, repository, digest
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `WWW-Authenticate` header of the form
/// `Bearer realm="…",service="…",scope="…"` into its parts.
pub fn parse_www_authenticate(header: &str) -> CaskResult<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ').ok_or_else(|| {
        CaskError::RegistryAuth(format!("malformed WWW-Authenticate header: '{}'", header))
    })?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for pair in params.split(',') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Ok(BearerChallenge {
        scheme: scheme.to_string(),
        realm: realm.ok_or_else(|| {
            CaskError::RegistryAuth(format!("challenge without realm: '{}'", header))
        })?,
        service,
        scope,
    })
}

/// Selects the linux/amd64 manifest from a manifest list, skipping attestation
/// entries.
pub fn select_platform_manifest(index: &ImageIndex) -> CaskResult<&Descriptor> {
    index
        .manifests()
        .iter()
        .find(|descriptor| {
            descriptor.platform().as_ref().is_some_and(|platform| {
                matches!(platform.os(), Os::Linux)
                    && *platform.architecture() == Arch::Amd64
                    && !descriptor
                        .annotations()
                        .as_ref()
                        .is_some_and(|a| a.contains_key(DOCKER_REFERENCE_TYPE_ANNOTATION))
            })
        })
        .ok_or(CaskError::ManifestNotFound)
}

/// Writes a manifest document as JSON, only when the target file is absent.
async fn persist_manifest<T: Serialize>(path: &Path, value: &T) -> CaskResult<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_www_authenticate() {
        let challenge = parse_www_authenticate(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/alpine:pull\"",
        )
        .unwrap();

        assert_eq!(challenge.scheme, "Bearer");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn test_parse_www_authenticate_without_scope() {
        let challenge =
            parse_www_authenticate("Bearer realm=\"https://auth.example/token\",service=\"reg\"")
                .unwrap();
        assert_eq!(challenge.scope, None);
        assert_eq!(challenge.service.as_deref(), Some("reg"));
    }

    #[test]
    fn test_parse_www_authenticate_rejects_malformed_input() {
        assert!(parse_www_authenticate("Bearer").is_err());
        assert!(parse_www_authenticate("Bearer service=\"reg\"").is_err());
    }

    #[test]
    fn test_select_platform_manifest_prefers_linux_amd64() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                    "size": 527,
                    "platform": { "architecture": "arm64", "os": "linux" }
                },
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                    "size": 527,
                    "platform": { "architecture": "amd64", "os": "linux" }
                },
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
                    "size": 527,
                    "platform": { "architecture": "amd64", "os": "linux" },
                    "annotations": { "vnd.docker.reference.type": "attestation-manifest" }
                }
            ]
        }))
        .unwrap();

        let descriptor = select_platform_manifest(&index).unwrap();
        assert!(descriptor.digest().to_string().starts_with("sha256:2222"));
    }

    #[test]
    fn test_select_platform_manifest_errors_when_absent() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                    "size": 527,
                    "platform": { "architecture": "arm64", "os": "linux" }
                }
            ]
        }))
        .unwrap();

        assert!(matches!(
            select_platform_manifest(&index),
            Err(CaskError::ManifestNotFound)
        ));
    }

    #[tokio::test]
    async fn test_session_round_trip() -> CaskResult<()> {
        let home = tempfile::tempdir()?;
        let config = CaskConfig::with_home(home.path());
        let registry = DockerRegistry::new(&config);

        let session = Session {
            token: "tok".into(),
            scheme: "Bearer".into(),
        };
        registry.save_session(&session).await?;

        let loaded = registry.session("http://unused.invalid", false).await?;
        assert_eq!(loaded.token, "tok");
        assert_eq!(loaded.scheme, "Bearer");

        Ok(())
    }

    #[tokio::test]
    #[ignore = "makes network requests to the Docker registry"]
    async fn test_docker_resolve_alpine() -> CaskResult<()> {
        let home = tempfile::tempdir()?;
        let config = CaskConfig::with_home(home.path());
        let registry = DockerRegistry::new(&config);

        let reference: Reference = "alpine:latest".parse()?;
        let (manifest, image_config) = registry.resolve(&reference).await?;

        assert_eq!(manifest.schema_version(), 2);
        assert!(!manifest.layers().is_empty());
        assert_eq!(
            manifest.layers().len(),
            image_config.rootfs().diff_ids().len()
        );
        assert!(home
            .path()
            .join("registry/alpine/manifests/base_manifest.json")
            .exists());

        Ok(())
    }
}
