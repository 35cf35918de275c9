//! Path and directory-name constants for the cask data layout.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory name for cask's global data.
pub const CASK_HOME_DIR: &str = ".cask";

/// The directory where per-image manifests are persisted.
///
/// Example: `<CASK_HOME>/<REGISTRY_SUBDIR>/<image>/<MANIFESTS_SUBDIR>`
pub const REGISTRY_SUBDIR: &str = "registry";

/// The subdirectory under an image's registry directory holding manifest JSON.
pub const MANIFESTS_SUBDIR: &str = "manifests";

/// The directory where raw gzipped layer blobs are stored, keyed by compressed digest.
///
/// Example: `<CASK_HOME>/<BLOB_SUBDIR>/<sha256:...>`
pub const BLOB_SUBDIR: &str = "blobs";

/// The directory where extracted layer trees are stored, keyed by uncompressed digest.
///
/// Example: `<CASK_HOME>/<LAYERS_SUBDIR>/<hex digest>/`
pub const LAYERS_SUBDIR: &str = "layers";

/// The directory where per-container runtime instances live.
///
/// Example: `<CASK_HOME>/<RUN_SUBDIR>/<safe container id>/`
pub const RUN_SUBDIR: &str = "run";

/// The filename of the cached registry session (token + scheme).
pub const SESSION_FILENAME: &str = "session.json";

/// The filename of the persisted manifest list ("fat manifest").
pub const BASE_MANIFEST_FILENAME: &str = "base_manifest.json";

/// The filename of the persisted platform-specific manifest.
pub const ARCH_MANIFEST_FILENAME: &str = "arch_manifest.json";

/// The filename of the persisted image configuration manifest.
pub const CONFIG_MANIFEST_FILENAME: &str = "config_manifest.json";

/// The subdirectory of a container instance holding the overlay upper/work dirs.
pub const OVERLAY_SUBDIR: &str = "overlay";

/// The overlay upper directory name.
pub const UPPER_DIRNAME: &str = "upperdir";

/// The overlay work directory name.
pub const WORK_DIRNAME: &str = "workdir";

/// The merged overlay mount point of a container instance.
pub const RUNTIME_DIRNAME: &str = "runtime_dir";

/// The scratch subdirectory of a container instance (staged resolver file).
pub const TEMP_SUBDIR: &str = "temp";

/// The resolver file staged for bind-mounting into the container.
pub const RESOLV_FILENAME: &str = "resolv.conf";

/// The holding directory for the old root during `pivot_root`.
pub const OLD_ROOT_DIRNAME: &str = "old_root";

/// The suffix of in-progress layer extraction directories.
pub const PARTIAL_EXTRACTION_SUFFIX: &str = "partial";
