use std::{
    fs::File,
    io::{Read, Write},
};

use ipnetwork::Ipv4Network;
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{fork, getgid, getuid, pipe, ForkResult, Gid, Pid, Uid},
};
use rand::Rng;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::runtime::Handle;

use crate::{
    config::CaskConfig,
    network::{mint_container_cidr, mint_veth_suffix, NetworkManager},
    oci::{self, Reference},
    rootfs::{RootfsAssembler, RootfsInstance},
    runtime::{child, CgroupHandle, ChildContext},
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What to launch: the image, the argv, and the resource/network parameters.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// The image to run.
    pub reference: Reference,

    /// The command and arguments exec'd as the container's PID 1.
    pub argv: Vec<String>,

    /// Optional memory limit string (e.g. `512mb`).
    pub mem_limit: Option<String>,

    /// Optional CPU share in percent of one core.
    pub cpu_percent: Option<u32>,

    /// Optional container address; minted from the bridge subnet when absent.
    pub container_cidr: Option<Ipv4Network>,
}

/// Orchestrates a container launch end to end.
///
/// The pull/assemble/host-network phases run on the owned tokio runtime via
/// its [`Handle`]; the fork and the two-barrier handshake with the child are
/// synchronous code on the calling thread. See the module docs for the exact
/// ordering contract.
#[derive(Debug)]
pub struct ContainerLauncher {
    /// The runtime configuration.
    config: CaskConfig,

    /// Handle to the async runtime used for registry and netlink work.
    handle: Handle,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerLauncher {
    /// Creates a new launcher.
    pub fn new(config: &CaskConfig, handle: Handle) -> Self {
        Self {
            config: config.clone(),
            handle,
        }
    }

    /// Runs a container to completion and returns its exit code.
    ///
    /// Pulls the image if needed, assembles the rootfs, wires the network and
    /// drives the two-process launch. Cleanup of the cgroup, overlay mount,
    /// instance directory and host veth endpoint is guaranteed on all paths.
    pub fn run(&self, spec: ContainerSpec) -> CaskResult<i32> {
        let container_id = mint_container_id(&spec.reference);
        tracing::info!(%container_id, image = %spec.reference, "launching container");

        let image_config = self
            .handle
            .block_on(oci::pull_image(&self.config, &spec.reference))?;
        let diff_ids = image_config.rootfs().diff_ids().clone();

        let owner = (getuid(), getgid());
        let assembler = RootfsAssembler::new(&self.config);
        let instance = self
            .handle
            .block_on(assembler.assemble(&container_id, &diff_ids, owner))?;

        let net = NetworkManager::new(&self.config);
        let suffix = mint_veth_suffix();

        // From here on the instance and the (possible) host veth endpoint are
        // torn down no matter how the launch ends.
        let cleanup_handle = self.handle.clone();
        let cleanup_net = net.clone();
        let cleanup_suffix = suffix.clone();
        let guarded_instance = scopeguard::guard(instance, move |instance: RootfsInstance| {
            if let Err(e) =
                cleanup_handle.block_on(cleanup_net.remove_host_endpoint(&cleanup_suffix))
            {
                tracing::warn!(error = %e, "failed to remove host veth endpoint");
            }
            instance.teardown();
        });

        self.handle.block_on(net.setup_host())?;

        self.launch(&spec, &container_id, &guarded_instance, &net, &suffix, owner)
    }

    /// The fork and the two-barrier handshake (states S1–S7).
    fn launch(
        &self,
        spec: &ContainerSpec,
        container_id: &str,
        instance: &RootfsInstance,
        net: &NetworkManager,
        suffix: &str,
        owner: (Uid, Gid),
    ) -> CaskResult<i32> {
        let container_cidr = match spec.container_cidr {
            Some(cidr) => cidr,
            None => mint_container_cidr(&self.config.bridge_cidr)?,
        };

        let cgroup = CgroupHandle::create(&self.config, container_id)?;
        cgroup.apply_limits(spec.mem_limit.as_deref(), spec.cpu_percent)?;

        let (ready_rd, ready_wr) = pipe()?;
        let (release_rd, release_wr) = pipe()?;

        match unsafe { fork() }
            .map_err(|errno| CaskError::Namespace(format!("fork failed: {}", errno)))?
        {
            ForkResult::Child => {
                drop(ready_rd);
                drop(release_wr);
                child::run(ChildContext {
                    hostname: container_id.to_string(),
                    runtime_dir: instance.runtime_dir().to_path_buf(),
                    resolv_source: instance.resolv_path(),
                    argv: spec.argv.clone(),
                    ready_signal: File::from(ready_wr),
                    release_signal: File::from(release_rd),
                })
            }
            ForkResult::Parent { child } => {
                drop(ready_wr);
                drop(release_rd);

                let handshake = self.complete_handshake(
                    child,
                    &cgroup,
                    net,
                    container_cidr,
                    suffix,
                    owner,
                    File::from(ready_rd),
                    File::from(release_wr),
                );
                if let Err(e) = handshake {
                    tracing::error!(error = %e, "handshake failed, killing child");
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(e);
                }

                wait_for_container(child)
            }
        }
    }

    /// Parent-side states S2–S5: wait for the unshare notification, write the
    /// ID maps, wire the network, place the child in its cgroup, release.
    #[allow(clippy::too_many_arguments)]
    fn complete_handshake(
        &self,
        child: Pid,
        cgroup: &CgroupHandle,
        net: &NetworkManager,
        container_cidr: Ipv4Network,
        suffix: &str,
        owner: (Uid, Gid),
        mut ready: File,
        mut release: File,
    ) -> CaskResult<()> {
        let mut byte = [0u8; 1];
        ready.read_exact(&mut byte)?;
        tracing::debug!(%child, "child unshared its namespaces");

        write_id_maps(child, owner)?;

        self.handle
            .block_on(net.wire_container(child, container_cidr, suffix))?;

        cgroup.add_process(child)?;

        release.write_all(b"1")?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the single-entry uid/gid maps for the child's user namespace,
/// mapping container root to the invoking user. `setgroups` must be denied
/// before an unprivileged user namespace accepts a gid map.
fn write_id_maps(child: Pid, owner: (Uid, Gid)) -> CaskResult<()> {
    let (uid, gid) = owner;
    let proc_base = format!("/proc/{}", child);

    std::fs::write(format!("{}/setgroups", proc_base), "deny")
        .map_err(|e| CaskError::Namespace(format!("failed to deny setgroups: {}", e)))?;
    std::fs::write(format!("{}/uid_map", proc_base), format!("0 {} 1\n", uid))
        .map_err(|e| CaskError::Namespace(format!("failed to write uid_map: {}", e)))?;
    std::fs::write(format!("{}/gid_map", proc_base), format!("0 {} 1\n", gid))
        .map_err(|e| CaskError::Namespace(format!("failed to write gid_map: {}", e)))?;

    tracing::debug!(%child, %uid, %gid, "wrote uid/gid maps");
    Ok(())
}

/// Waits for the child, forwarding SIGINT/SIGTERM to it, and maps its wait
/// status to an exit code (`128 + signo` for signal deaths).
fn wait_for_container(child: Pid) -> CaskResult<i32> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let raw_child = child.as_raw();

    let forwarder = std::thread::spawn(move || {
        for signal in signals.forever() {
            let forwarded = Signal::try_from(signal).unwrap_or(Signal::SIGTERM);
            let _ = kill(Pid::from_raw(raw_child), forwarded);
        }
    });

    let result = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => break Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => break Err(errno.into()),
        }
    };

    signals_handle.close();
    let _ = forwarder.join();

    result
}

/// Mints a unique container id from the image reference plus a random suffix.
/// The id doubles as the container's hostname and its directory names.
pub fn mint_container_id(reference: &Reference) -> String {
    format!(
        "{}_{}",
        reference.safe_id(),
        hex::encode(rand::thread_rng().gen::<[u8; 4]>())
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
