use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::{
    config::CaskConfig,
    utils::{cpu_max_line, parse_mem_limit},
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A per-container directory in the cgroup v2 unified hierarchy.
///
/// Lifecycle: created before fork, the child PID written to `cgroup.procs`
/// after fork, the directory removed when the handle drops — after the
/// container has been reaped, so the cgroup is empty by then.
#[derive(Debug)]
pub struct CgroupHandle {
    /// The per-container cgroup directory.
    path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CgroupHandle {
    /// Creates the per-container cgroup directory.
    ///
    /// The parent subtree is created as needed and `+cpu +memory` written to
    /// its `cgroup.subtree_control`; that write commonly fails when the
    /// controllers are already enabled, which is tolerated. Failure to create
    /// the per-container directory itself is fatal.
    pub fn create(config: &CaskConfig, container_id: &str) -> CaskResult<Self> {
        let parent = config.cgroup_root.join(&config.cgroup_parent);
        std::fs::create_dir_all(&parent)
            .map_err(|e| CaskError::Cgroup(format!("failed to create {}: {}", parent.display(), e)))?;

        if let Err(e) = std::fs::write(parent.join("cgroup.subtree_control"), "+cpu +memory") {
            tracing::warn!(error = %e, "could not enable cpu/memory controllers, continuing");
        }

        let path = config.cgroup_dir(container_id);
        std::fs::create_dir(&path)
            .map_err(|e| CaskError::Cgroup(format!("failed to create {}: {}", path.display(), e)))?;

        tracing::debug!(?path, "created cgroup");
        Ok(Self { path })
    }

    /// Writes the resource limits: `memory.max` takes the parsed byte count,
    /// `cpu.max` takes `"<quota> <period>"` with a 100 ms period.
    pub fn apply_limits(
        &self,
        mem_limit: Option<&str>,
        cpu_percent: Option<u32>,
    ) -> CaskResult<()> {
        if let Some(limit) = mem_limit {
            let bytes = parse_mem_limit(limit)?;
            self.write_control("memory.max", &bytes.to_string())?;
        }

        if let Some(percent) = cpu_percent {
            self.write_control("cpu.max", &cpu_max_line(percent))?;
        }

        Ok(())
    }

    /// Moves a process into this cgroup.
    pub fn add_process(&self, pid: Pid) -> CaskResult<()> {
        self.write_control("cgroup.procs", &pid.to_string())
    }

    /// The cgroup directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_control(&self, file: &str, value: &str) -> CaskResult<()> {
        let path = self.path.join(file);
        std::fs::write(&path, value)
            .map_err(|e| CaskError::Cgroup(format!("failed to write {}: {}", path.display(), e)))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(?self.path, error = %e, "failed to remove cgroup directory");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
