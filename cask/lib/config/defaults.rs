use std::{path::PathBuf, sync::LazyLock};

use crate::utils::CASK_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The path where all cask global data is stored.
pub static DEFAULT_CASK_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap().join(CASK_HOME_DIR));

/// Base URL for Docker Registry v2 API.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// The default OCI reference tag.
pub const DEFAULT_REFERENCE_TAG: &str = "latest";

/// The default repository namespace for single-segment image names on Docker Hub.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// The default name of the host bridge device.
pub const DEFAULT_BRIDGE_NAME: &str = "cbr0";

/// The default bridge address and subnet. The bridge IP doubles as the
/// containers' default gateway.
pub const DEFAULT_BRIDGE_CIDR: &str = "172.20.0.1/24";

/// The root of the cgroup v2 unified hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// The subtree under the cgroup root that holds per-container cgroups.
pub const DEFAULT_CGROUP_PARENT: &str = "cask";
