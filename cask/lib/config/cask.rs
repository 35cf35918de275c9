use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;

use crate::{
    config::{DEFAULT_BRIDGE_CIDR, DEFAULT_BRIDGE_NAME, DEFAULT_CGROUP_PARENT, DEFAULT_CGROUP_ROOT, DEFAULT_REGISTRY_URL},
    utils::{
        self, BLOB_SUBDIR, LAYERS_SUBDIR, MANIFESTS_SUBDIR, REGISTRY_SUBDIR, RUN_SUBDIR,
        SESSION_FILENAME,
    },
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration record for a cask runtime instance.
///
/// Every component constructor takes this record explicitly; there are no
/// ambient globals. Paths derive from a single home directory which can be
/// overridden with the `CASK_HOME` environment variable.
#[derive(Debug, Clone)]
pub struct CaskConfig {
    /// The directory where all cask data lives.
    pub home_dir: PathBuf,

    /// Base URL of the image registry.
    pub registry_url: String,

    /// Name of the host bridge device.
    pub bridge_name: String,

    /// Bridge address and subnet; the address is the containers' gateway.
    pub bridge_cidr: Ipv4Network,

    /// Root of the cgroup v2 unified hierarchy.
    pub cgroup_root: PathBuf,

    /// Subtree under the cgroup root for per-container cgroups.
    pub cgroup_parent: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CaskConfig {
    /// Creates a configuration rooted at the given home directory, with
    /// defaults for everything else.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            bridge_cidr: DEFAULT_BRIDGE_CIDR.parse().unwrap(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            cgroup_parent: DEFAULT_CGROUP_PARENT.to_string(),
        }
    }

    /// The directory where pulled manifests are persisted, per image.
    pub fn manifests_dir(&self, image_name: &str) -> PathBuf {
        self.home_dir
            .join(REGISTRY_SUBDIR)
            .join(image_name.replace('/', "_"))
            .join(MANIFESTS_SUBDIR)
    }

    /// The directory holding raw gzipped layer blobs, keyed by compressed digest.
    pub fn blob_dir(&self) -> PathBuf {
        self.home_dir.join(BLOB_SUBDIR)
    }

    /// The directory holding extracted layer trees, keyed by uncompressed digest.
    pub fn layer_dir(&self) -> PathBuf {
        self.home_dir.join(LAYERS_SUBDIR)
    }

    /// The directory holding per-container runtime instances.
    pub fn run_dir(&self) -> PathBuf {
        self.home_dir.join(RUN_SUBDIR)
    }

    /// The path of the cached registry session file.
    pub fn session_path(&self) -> PathBuf {
        self.home_dir.join(SESSION_FILENAME)
    }

    /// The per-container cgroup directory.
    pub fn cgroup_dir(&self, container_id: &str) -> PathBuf {
        self.cgroup_root.join(&self.cgroup_parent).join(container_id)
    }
}

impl Default for CaskConfig {
    fn default() -> Self {
        Self::with_home(utils::get_cask_home_path())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AsRef<Path> for CaskConfig {
    fn as_ref(&self) -> &Path {
        &self.home_dir
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths_derive_from_home() {
        let config = CaskConfig::with_home("/var/lib/cask");

        assert_eq!(config.blob_dir(), PathBuf::from("/var/lib/cask/blobs"));
        assert_eq!(config.layer_dir(), PathBuf::from("/var/lib/cask/layers"));
        assert_eq!(config.run_dir(), PathBuf::from("/var/lib/cask/run"));
        assert_eq!(
            config.session_path(),
            PathBuf::from("/var/lib/cask/session.json")
        );
        assert_eq!(
            config.manifests_dir("alpine"),
            PathBuf::from("/var/lib/cask/registry/alpine/manifests")
        );
    }

    #[test]
    fn test_config_namespaced_image_dir_is_flattened() {
        let config = CaskConfig::with_home("/var/lib/cask");
        assert_eq!(
            config.manifests_dir("library/alpine"),
            PathBuf::from("/var/lib/cask/registry/library_alpine/manifests")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = CaskConfig::with_home("/tmp/cask");
        assert_eq!(config.bridge_name, "cbr0");
        assert_eq!(config.bridge_cidr.prefix(), 24);
        assert_eq!(
            config.cgroup_dir("alpine_latest_ab12cd34"),
            PathBuf::from("/sys/fs/cgroup/cask/alpine_latest_ab12cd34")
        );
    }
}
