use std::path::{Path, PathBuf};

use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    unistd::{chown, Gid, Uid},
};
use tokio::fs;

use crate::{
    config::CaskConfig,
    oci::{diff_id_hex, ImageStore},
    utils::{
        OLD_ROOT_DIRNAME, OVERLAY_SUBDIR, RESOLV_FILENAME, RUNTIME_DIRNAME, TEMP_SUBDIR,
        UPPER_DIRNAME, WORK_DIRNAME,
    },
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Resolver files tried in order when staging DNS configuration. systemd's
/// resolved writes the real upstream servers to the first one; `/etc/resolv.conf`
/// may point at a stub listener unreachable from the container.
const RESOLV_SOURCES: [&str; 2] = ["/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

/// Fallback resolver content when no host resolver file is readable.
const RESOLV_FALLBACK: &str = "nameserver 8.8.8.8\n";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builds per-container root filesystems from the extracted-layer store.
#[derive(Debug)]
pub struct RootfsAssembler {
    /// The directory holding per-container instances.
    run_dir: PathBuf,

    /// The extracted-layer store the lower directories come from.
    store: ImageStore,
}

/// A mounted per-container rootfs instance.
///
/// Layout: `<run_dir>/<safe_cid>/{overlay/{upperdir,workdir}, runtime_dir, temp/}`
/// with the overlay mounted on `runtime_dir`.
#[derive(Debug)]
pub struct RootfsInstance {
    /// The instance base directory.
    base_dir: PathBuf,

    /// The merged overlay mount point — the container's future root.
    runtime_dir: PathBuf,

    /// The scratch directory holding the staged resolver file.
    temp_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RootfsAssembler {
    /// Creates a new assembler from the runtime configuration.
    pub fn new(config: &CaskConfig) -> Self {
        Self {
            run_dir: config.run_dir(),
            store: ImageStore::new(config),
        }
    }

    /// Assembles a writable rootfs for a container from the ordered layer set.
    ///
    /// `diff_ids` comes from the image configuration, base layer first. The
    /// overlay `lowerdir=` option requires the topmost layer first, so the
    /// list is reversed when composing the mount options. The instance's
    /// writable dirs are chowned to `owner`, the identity the container's
    /// root maps to.
    pub async fn assemble(
        &self,
        container_id: &str,
        diff_ids: &[String],
        owner: (Uid, Gid),
    ) -> CaskResult<RootfsInstance> {
        let base_dir = self.run_dir.join(container_id);
        let overlay_dir = base_dir.join(OVERLAY_SUBDIR);
        let upperdir = overlay_dir.join(UPPER_DIRNAME);
        let workdir = overlay_dir.join(WORK_DIRNAME);
        let runtime_dir = base_dir.join(RUNTIME_DIRNAME);
        let temp_dir = base_dir.join(TEMP_SUBDIR);

        for dir in [&upperdir, &workdir, &runtime_dir, &temp_dir] {
            fs::create_dir_all(dir).await?;
        }

        let lowerdirs = self.lowerdirs_for(diff_ids)?;
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            compose_lowerdir(&lowerdirs),
            upperdir.display(),
            workdir.display()
        );

        tracing::debug!(?runtime_dir, %options, "mounting overlay");
        if let Err(errno) = mount(
            Some("overlay"),
            &runtime_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        ) {
            let _ = std::fs::remove_dir_all(&base_dir);
            return Err(CaskError::Mount {
                target: runtime_dir,
                errno,
            });
        }

        let instance = RootfsInstance {
            base_dir,
            runtime_dir,
            temp_dir,
        };

        if let Err(e) = self.prepare_pivot_targets(&instance, owner).await {
            instance.teardown();
            return Err(e);
        }

        Ok(instance)
    }

    /// Maps ordered diff_ids onto extracted-layer paths, verifying each layer
    /// has been materialized.
    fn lowerdirs_for(&self, diff_ids: &[String]) -> CaskResult<Vec<PathBuf>> {
        diff_ids
            .iter()
            .map(|diff_id| {
                let path = self.store.extracted_path(diff_id_hex(diff_id));
                if !path.exists() {
                    return Err(CaskError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("extracted layer not found: {}", path.display()),
                    )));
                }
                Ok(path)
            })
            .collect()
    }

    /// Creates everything the child's pivot sequence expects inside and next
    /// to the merged mount: the `old_root` holding directory, the
    /// `etc/resolv.conf` bind target, and the staged resolver file. The
    /// writable paths are handed to the mapped user.
    async fn prepare_pivot_targets(
        &self,
        instance: &RootfsInstance,
        owner: (Uid, Gid),
    ) -> CaskResult<()> {
        let old_root = instance.runtime_dir.join(OLD_ROOT_DIRNAME);
        fs::create_dir_all(&old_root).await?;

        let etc_dir = instance.runtime_dir.join("etc");
        fs::create_dir_all(&etc_dir).await?;

        // The bind target must be a regular file; images commonly ship
        // /etc/resolv.conf as a (possibly dangling) symlink.
        let resolv_target = etc_dir.join(RESOLV_FILENAME);
        if fs::symlink_metadata(&resolv_target).await.is_ok() {
            fs::remove_file(&resolv_target).await?;
        }
        fs::write(&resolv_target, b"").await?;

        stage_resolv_conf_from(
            &RESOLV_SOURCES.map(PathBuf::from),
            &instance.resolv_path(),
        )
        .await?;

        let (uid, gid) = owner;
        for path in [
            &instance.base_dir,
            &instance.runtime_dir,
            &old_root,
            &instance.temp_dir,
        ] {
            chown(path.as_path(), Some(uid), Some(gid))?;
        }

        Ok(())
    }
}

impl RootfsInstance {
    /// The merged overlay mount point — the container's future root.
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// The staged resolver file the child bind-mounts over `/etc/resolv.conf`.
    pub fn resolv_path(&self) -> PathBuf {
        self.temp_dir.join(RESOLV_FILENAME)
    }

    /// Detaches the overlay mount. Best-effort; failures are logged.
    pub fn unmount(&self) {
        if let Err(errno) = umount2(&self.runtime_dir, MntFlags::MNT_DETACH) {
            tracing::warn!(?self.runtime_dir, %errno, "failed to unmount overlay");
        }
    }

    /// Unmounts the overlay and removes the whole instance directory.
    pub fn teardown(self) {
        self.unmount();
        if let Err(e) = std::fs::remove_dir_all(&self.base_dir) {
            tracing::warn!(?self.base_dir, error = %e, "failed to remove container instance dir");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Composes the overlay `lowerdir=` value from base-first layer paths.
/// overlayfs gives the leftmost entry the highest precedence, so the order is
/// reversed here.
pub fn compose_lowerdir(lowerdirs: &[PathBuf]) -> String {
    lowerdirs
        .iter()
        .rev()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Copies the first readable source to `dest`; writes the public-DNS fallback
/// when none is.
pub(crate) async fn stage_resolv_conf_from(sources: &[PathBuf], dest: &Path) -> CaskResult<()> {
    for source in sources {
        match fs::copy(source, dest).await {
            Ok(_) => {
                tracing::debug!(?source, "staged resolver configuration");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(?source, error = %e, "resolver source unusable");
            }
        }
    }

    tracing::warn!("no host resolver file readable, staging fallback nameserver");
    fs::write(dest, RESOLV_FALLBACK).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_lowerdir_reverses_diff_id_order() {
        let lowerdirs = vec![
            PathBuf::from("/layers/d0"),
            PathBuf::from("/layers/d1"),
            PathBuf::from("/layers/d2"),
        ];
        assert_eq!(compose_lowerdir(&lowerdirs), "/layers/d2:/layers/d1:/layers/d0");
    }

    #[test]
    fn test_compose_lowerdir_single_layer() {
        assert_eq!(
            compose_lowerdir(&[PathBuf::from("/layers/only")]),
            "/layers/only"
        );
    }

    #[tokio::test]
    async fn test_stage_resolv_conf_prefers_first_readable_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("systemd-resolv.conf");
        let present = dir.path().join("etc-resolv.conf");
        fs::write(&present, "nameserver 10.0.0.53\n").await.unwrap();

        let dest = dir.path().join("staged.conf");
        stage_resolv_conf_from(&[missing, present], &dest).await.unwrap();

        assert_eq!(
            fs::read_to_string(&dest).await.unwrap(),
            "nameserver 10.0.0.53\n"
        );
    }

    #[tokio::test]
    async fn test_stage_resolv_conf_falls_back_to_public_dns() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("staged.conf");

        stage_resolv_conf_from(&[dir.path().join("nope")], &dest)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&dest).await.unwrap(), RESOLV_FALLBACK);
    }

    #[tokio::test]
    async fn test_lowerdirs_require_materialized_layers() {
        let home = tempfile::tempdir().unwrap();
        let config = CaskConfig::with_home(home.path());
        let assembler = RootfsAssembler::new(&config);

        let diff_ids = vec![format!("sha256:{}", "a".repeat(64))];
        assert!(assembler.lowerdirs_for(&diff_ids).is_err());

        std::fs::create_dir_all(config.layer_dir().join("a".repeat(64))).unwrap();
        let lowerdirs = assembler.lowerdirs_for(&diff_ids).unwrap();
        assert_eq!(lowerdirs[0], config.layer_dir().join("a".repeat(64)));
    }
}
