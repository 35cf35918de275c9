use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a cask-related operation.
pub type CaskResult<T> = Result<T, CaskError>;

/// An error that occurred during a container runtime operation.
#[derive(Debug, Error)]
pub enum CaskError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when serializing or deserializing JSON.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred during a system call.
    #[error("system call error: {0}")]
    SystemCall(#[from] Errno),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred during a netlink operation.
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// An error that occurred when parsing a CIDR or IP address.
    #[error("invalid network address: {0}")]
    InvalidCidr(#[from] ipnetwork::IpNetworkError),

    /// An error that occurred when parsing an image reference.
    #[error("invalid image reference: {0}")]
    ImageReference(String),

    /// An error that occurred when parsing a memory limit string.
    #[error("invalid memory limit: {0}")]
    InvalidMemoryLimit(String),

    /// An error that occurred during registry token authentication.
    #[error("registry authentication failed: {0}")]
    RegistryAuth(String),

    /// An error response from the registry.
    #[error("registry request failed ({status}): {url}")]
    RegistryRequest {
        /// The HTTP status code returned by the registry.
        status: u16,
        /// The URL that was requested.
        url: String,
    },

    /// An error that occurred when no manifest matched the target platform.
    #[error("no manifest found for linux/amd64")]
    ManifestNotFound,

    /// An error that occurred when a downloaded blob failed digest verification.
    #[error("blob digest mismatch: expected {expected}, computed {computed}")]
    BlobDigestMismatch {
        /// The digest advertised by the registry.
        expected: String,
        /// The digest computed from the downloaded bytes.
        computed: String,
    },

    /// An error that occurred when an extracted layer did not match its diff_id.
    #[error("layer digest mismatch: expected diff_id {expected}, computed {computed}")]
    LayerDigestMismatch {
        /// The diff_id listed in the image configuration.
        expected: String,
        /// The digest computed by streaming gunzip of the blob.
        computed: String,
    },

    /// An error that occurred during layer extraction.
    #[error("layer extraction error: {0}")]
    LayerExtraction(String),

    /// An error that occurred while mounting or unmounting a filesystem.
    #[error("mount failed on {target}: {errno}")]
    Mount {
        /// The mount target.
        target: PathBuf,
        /// The errno returned by the kernel.
        errno: Errno,
    },

    /// An error that occurred during namespace setup (unshare, maps, pivot_root).
    #[error("namespace error: {0}")]
    Namespace(String),

    /// An error that occurred during cgroup setup or teardown.
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// An error that occurred when the requested command does not exist in the rootfs.
    #[error("command not found in container: {0}")]
    ExecNotFound(String),

    /// An error that occurred when a network interface name exceeds IFNAMSIZ.
    #[error("interface name too long: {0}")]
    InterfaceNameTooLong(String),

    /// An error that occurred when no IPv4 default route exists on the host.
    #[error("no IPv4 default route found on the host")]
    NoDefaultRoute,

    /// An error that occurred during network device setup.
    #[error("network setup error: {0}")]
    Network(String),

    /// An error that occurred while managing firewall rules.
    #[error("firewall error: {0}")]
    Firewall(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CaskError {
    /// Maps the error onto the CLI exit-code contract: `2` when the requested
    /// command does not exist inside the container, `1` for every other
    /// launch-side failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            CaskError::ExecNotFound(_) => 2,
            _ => 1,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(CaskError::ExecNotFound("lsx".into()).exit_code(), 2);
        assert_eq!(CaskError::ManifestNotFound.exit_code(), 1);
        assert_eq!(
            CaskError::InvalidMemoryLimit("64xb".into()).exit_code(),
            1
        );
    }
}
