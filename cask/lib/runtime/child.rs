use std::{
    convert::Infallible,
    ffi::CString,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    process,
};

use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    sys::wait::{waitpid, WaitStatus},
    unistd::{chdir, execvpe, fork, pivot_root, sethostname, setgid, setuid, ForkResult, Gid, Uid},
};

use crate::{
    utils::{OLD_ROOT_DIRNAME, RESOLV_FILENAME},
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The PATH handed to the container entrypoint.
const CONTAINER_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the container-side routine needs after the fork.
#[derive(Debug)]
pub struct ChildContext {
    /// The container id, used as the hostname.
    pub hostname: String,

    /// The merged overlay mount point to pivot into.
    pub runtime_dir: PathBuf,

    /// The staged resolver file bind-mounted over `etc/resolv.conf`.
    pub resolv_source: PathBuf,

    /// The command and arguments to exec as PID 1.
    pub argv: Vec<String>,

    /// Write end of the child→parent barrier pipe.
    pub ready_signal: File,

    /// Read end of the parent→child barrier pipe.
    pub release_signal: File,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The container-side routine, entered right after `fork`. Never returns.
///
/// This process (the shim) unshares the namespaces, handshakes with the
/// parent, then forks the actual container init: `unshare(CLONE_NEWPID)`
/// affects children only, so the workload must be one fork below the shim to
/// run as PID 1. The shim waits for init and exits with its status, keeping
/// `$?` faithful through both processes.
pub fn run(mut ctx: ChildContext) -> ! {
    let code = match shim(&mut ctx) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cask: container setup failed: {}", e);
            e.exit_code() as i32
        }
    };
    process::exit(code);
}

fn shim(ctx: &mut ChildContext) -> CaskResult<i32> {
    // Everything except the cgroup namespace: the parent still has to place
    // this process in its cgroup, and the namespace root is captured at
    // unshare time.
    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS,
    )
    .map_err(|errno| CaskError::Namespace(format!("unshare failed: {}", errno)))?;

    // First barrier: tell the parent the namespaces exist.
    ctx.ready_signal.write_all(b"1")?;

    // Second barrier: the parent writes the uid/gid maps, wires the network
    // and places us in the cgroup before this read returns.
    let mut byte = [0u8; 1];
    ctx.release_signal.read_exact(&mut byte)?;

    // The maps are in place; become root of the user namespace.
    setgid(Gid::from_raw(0))?;
    setuid(Uid::from_raw(0))?;

    sethostname(&ctx.hostname)?;

    // Now that cgroup.procs contains this PID, the cgroup namespace roots at
    // the container's own cgroup.
    unshare(CloneFlags::CLONE_NEWCGROUP)
        .map_err(|errno| CaskError::Namespace(format!("unshare(cgroup) failed: {}", errno)))?;

    match unsafe { fork() }
        .map_err(|errno| CaskError::Namespace(format!("init fork failed: {}", errno)))?
    {
        ForkResult::Child => {
            // PID 1 of the new namespace.
            let code = match init(ctx) {
                Err(CaskError::ExecNotFound(command)) => {
                    eprintln!("cask: {}: command not found", command);
                    2
                }
                Err(e) => {
                    eprintln!("cask: container init failed: {}", e);
                    1
                }
                Ok(never) => match never {},
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            let status = loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                }
            };
            Ok(status)
        }
    }
}

/// The init-side routine: makes the rootfs the root and execs the workload.
/// Runs as PID 1 inside the container's namespaces.
fn init(ctx: &ChildContext) -> CaskResult<Infallible> {
    // Stop mount events from leaking back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|errno| mount_error("/", errno))?;

    // pivot_root needs new_root to be a mount point.
    bind_mount(&ctx.runtime_dir, &ctx.runtime_dir)?;

    let resolv_target = ctx.runtime_dir.join("etc").join(RESOLV_FILENAME);
    bind_mount(&ctx.resolv_source, &resolv_target)?;

    chdir(&ctx.runtime_dir)?;
    pivot_root(".", OLD_ROOT_DIRNAME)
        .map_err(|errno| CaskError::Namespace(format!("pivot_root failed: {}", errno)))?;
    chdir("/")?;

    let old_root = format!("/{}", OLD_ROOT_DIRNAME);
    umount2(old_root.as_str(), MntFlags::MNT_DETACH)
        .map_err(|errno| mount_error(&old_root, errno))?;
    std::fs::remove_dir(&old_root)?;

    // A procfs instance for the new PID namespace.
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|errno| mount_error("/proc", errno))?;

    // sysfs and the unified cgroup hierarchy, so the container can read its
    // own limits. Best-effort: some kernels refuse sysfs in a user namespace.
    let _ = mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    );
    let _ = mount(
        Some("cgroup2"),
        "/sys/fs/cgroup",
        Some("cgroup2"),
        MsFlags::empty(),
        None::<&str>,
    );

    let argv = build_argv(&ctx.argv)?;
    let envp = build_envp(&ctx.hostname);

    match execvpe(&argv[0], &argv, &envp) {
        Err(Errno::ENOENT) => Err(CaskError::ExecNotFound(ctx.argv[0].clone())),
        Err(errno) => Err(CaskError::Namespace(format!(
            "exec of {} failed: {}",
            ctx.argv[0], errno
        ))),
        Ok(never) => match never {},
    }
}

fn bind_mount(source: &Path, target: &Path) -> CaskResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| CaskError::Mount {
        target: target.to_path_buf(),
        errno,
    })
}

fn mount_error(target: &str, errno: Errno) -> CaskError {
    CaskError::Mount {
        target: PathBuf::from(target),
        errno,
    }
}

fn build_argv(argv: &[String]) -> CaskResult<Vec<CString>> {
    if argv.is_empty() {
        return Err(CaskError::Namespace("empty container argv".into()));
    }
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_str())
                .map_err(|_| CaskError::Namespace(format!("argv contains NUL byte: {:?}", arg)))
        })
        .collect()
}

fn build_envp(hostname: &str) -> Vec<CString> {
    [
        format!("PATH={}", CONTAINER_PATH_ENV),
        format!("HOSTNAME={}", hostname),
        "HOME=/root".to_string(),
        "TERM=xterm".to_string(),
    ]
    .into_iter()
    .map(|pair| CString::new(pair).unwrap())
    .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
