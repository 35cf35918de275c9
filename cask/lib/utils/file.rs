use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncReadExt};

use crate::CaskResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Read granularity for streamed hashing.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the SHA-256 of a file without reading it into memory at once.
pub async fn file_sha256_hex(path: &Path) -> CaskResult<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sha256_hex() -> CaskResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"hello cask").await?;

        let expected = hex::encode(Sha256::digest(b"hello cask"));
        assert_eq!(file_sha256_hex(&path).await?, expected);

        Ok(())
    }
}
