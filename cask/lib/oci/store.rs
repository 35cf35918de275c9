use std::{fs::File, io::Read, path::{Path, PathBuf}};

use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use tar::Archive;
use tokio::fs;

use crate::{
    config::CaskConfig, utils::PARTIAL_EXTRACTION_SUFFIX, CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Read granularity for the streamed gunzip-and-hash pass.
const GUNZIP_CHUNK_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Content-addressed storage for image layers.
///
/// Two indexes exist side by side: compressed blobs keyed by the registry
/// digest (written by the registry client), and extracted layer trees keyed by
/// the uncompressed SHA-256 — the `diff_id` the image configuration lists.
/// Each layer is extracted at most once; layer sharing across images follows
/// from the content addressing.
#[derive(Debug, Clone)]
pub struct ImageStore {
    /// The directory holding extracted layer trees.
    layer_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageStore {
    /// Creates a new store from the runtime configuration.
    pub fn new(config: &CaskConfig) -> Self {
        Self {
            layer_dir: config.layer_dir(),
        }
    }

    /// Returns the extraction directory for an uncompressed digest (hex form).
    pub fn extracted_path(&self, digest_hex: &str) -> PathBuf {
        self.layer_dir.join(digest_hex)
    }

    /// Computes the SHA-256 of the streamed decompression of a gzipped blob.
    ///
    /// The decompressed bytes flow straight into the hasher and are never
    /// materialized on disk or in memory as a whole.
    pub async fn uncompressed_digest(&self, blob_path: &Path) -> CaskResult<String> {
        let blob_path = blob_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> CaskResult<String> {
            let file = File::open(&blob_path)?;
            let mut decoder = GzDecoder::new(file);
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; GUNZIP_CHUNK_SIZE];

            loop {
                let read = decoder.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }

            Ok(hex::encode(hasher.finalize()))
        })
        .await?
    }

    /// Ensures the blob is extracted into the layer store, returning the
    /// extraction directory.
    ///
    /// The uncompressed digest names the directory; when the caller passes the
    /// expected `diff_id`, a mismatch is fatal. An existing directory skips
    /// all work. In-progress extractions claim a `<digest>.partial` directory
    /// (atomic `create_dir` sentinel) and commit with a rename, so a crashed
    /// run never leaves a half-extracted tree under the final name.
    pub async fn ensure_extracted(
        &self,
        blob_path: &Path,
        expected_diff_id: Option<&str>,
    ) -> CaskResult<PathBuf> {
        let digest = self.uncompressed_digest(blob_path).await?;

        if let Some(expected) = expected_diff_id {
            let expected_hex = diff_id_hex(expected);
            if expected_hex != digest {
                return Err(CaskError::LayerDigestMismatch {
                    expected: expected.to_string(),
                    computed: digest,
                });
            }
        }

        let extracted = self.extracted_path(&digest);
        if extracted.exists() {
            tracing::debug!(%digest, "layer already extracted, skipping");
            return Ok(extracted);
        }

        fs::create_dir_all(&self.layer_dir).await?;

        let partial = self
            .layer_dir
            .join(format!("{}.{}", digest, PARTIAL_EXTRACTION_SUFFIX));
        if partial.exists() {
            tracing::warn!(?partial, "removing stale partial extraction");
            fs::remove_dir_all(&partial).await?;
        }

        tracing::info!(%digest, "extracting layer");
        let blob_path = blob_path.to_path_buf();
        let partial_clone = partial.clone();

        tokio::task::spawn_blocking(move || -> CaskResult<()> {
            std::fs::create_dir(&partial_clone)?;

            let file = File::open(&blob_path)?;
            let tar = GzDecoder::new(file);
            let mut archive = Archive::new(tar);
            archive.set_preserve_permissions(true);
            archive.set_preserve_mtime(true);
            archive.set_unpack_xattrs(true);

            archive.unpack(&partial_clone).map_err(|e| {
                CaskError::LayerExtraction(format!(
                    "failed to unpack {}: {}",
                    blob_path.display(),
                    e
                ))
            })
        })
        .await??;

        match fs::rename(&partial, &extracted).await {
            Ok(()) => Ok(extracted),
            // Lost a commit race with a concurrent puller; theirs is equivalent.
            Err(_) if extracted.exists() => {
                fs::remove_dir_all(&partial).await?;
                Ok(extracted)
            }
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Strips the algorithm prefix from a `diff_id` (`sha256:<hex>` → `<hex>`).
pub fn diff_id_hex(diff_id: &str) -> &str {
    diff_id.rsplit(':').next().unwrap_or(diff_id)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::CaskConfig;

    fn gzipped_tar_layer(file_name: &str, content: &[u8]) -> (Vec<u8>, String) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, content)
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let diff_id = hex::encode(Sha256::digest(&tar_bytes));

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let gz_bytes = encoder.finish().unwrap();

        (gz_bytes, diff_id)
    }

    async fn store_with_blob(content: &[u8]) -> (tempfile::TempDir, ImageStore, PathBuf, String) {
        let home = tempfile::tempdir().unwrap();
        let config = CaskConfig::with_home(home.path());
        let store = ImageStore::new(&config);

        let (gz_bytes, diff_id) = gzipped_tar_layer("hello.txt", content);
        let blob_path = home.path().join("blob.tar.gz");
        fs::write(&blob_path, &gz_bytes).await.unwrap();

        (home, store, blob_path, diff_id)
    }

    #[test]
    fn test_diff_id_hex() {
        assert_eq!(diff_id_hex("sha256:abcd"), "abcd");
        assert_eq!(diff_id_hex("abcd"), "abcd");
    }

    #[tokio::test]
    async fn test_uncompressed_digest_round_trip() {
        let (_home, store, blob_path, diff_id) = store_with_blob(b"layer content").await;

        let computed = store.uncompressed_digest(&blob_path).await.unwrap();
        assert_eq!(computed, diff_id);
    }

    #[tokio::test]
    async fn test_ensure_extracted_names_directory_by_digest() {
        let (_home, store, blob_path, diff_id) = store_with_blob(b"layer content").await;

        let extracted = store
            .ensure_extracted(&blob_path, Some(&format!("sha256:{}", diff_id)))
            .await
            .unwrap();

        assert_eq!(extracted, store.extracted_path(&diff_id));
        assert_eq!(
            fs::read(extracted.join("hello.txt")).await.unwrap(),
            b"layer content"
        );
    }

    #[tokio::test]
    async fn test_ensure_extracted_is_idempotent() {
        let (_home, store, blob_path, _diff_id) = store_with_blob(b"idempotent").await;

        let extracted = store.ensure_extracted(&blob_path, None).await.unwrap();
        let mtime_before = fs::metadata(&extracted).await.unwrap().modified().unwrap();
        let file_mtime_before = fs::metadata(extracted.join("hello.txt"))
            .await
            .unwrap()
            .modified()
            .unwrap();

        let again = store.ensure_extracted(&blob_path, None).await.unwrap();
        assert_eq!(again, extracted);
        assert_eq!(
            fs::metadata(&extracted).await.unwrap().modified().unwrap(),
            mtime_before
        );
        assert_eq!(
            fs::metadata(extracted.join("hello.txt"))
                .await
                .unwrap()
                .modified()
                .unwrap(),
            file_mtime_before
        );
    }

    #[tokio::test]
    async fn test_ensure_extracted_rejects_diff_id_mismatch() {
        let (_home, store, blob_path, _diff_id) = store_with_blob(b"mismatch").await;

        let bogus = format!("sha256:{}", "0".repeat(64));
        let result = store.ensure_extracted(&blob_path, Some(&bogus)).await;

        assert!(matches!(
            result,
            Err(CaskError::LayerDigestMismatch { .. })
        ));
        // Nothing may be committed to the store on a mismatch.
        assert!(!store.extracted_path(&"0".repeat(64)).exists());
    }
}
