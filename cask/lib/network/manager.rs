use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::{
    address::AddressAttribute,
    link::LinkAttribute,
    route::RouteAttribute,
};
use nix::unistd::Pid;
use rand::Rng;
use rtnetlink::{Handle, IpVersion};
use tokio::fs;

use crate::{
    config::CaskConfig,
    network::{self, firewall},
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of the veth end that stays on the host bridge.
pub const VETH_HOST_PREFIX: &str = "vh-";

/// Prefix of the veth end that moves into the container's namespace.
pub const VETH_PEER_PREFIX: &str = "vc-";

/// The interface name the moved peer is renamed to inside the container.
pub const CONTAINER_IFNAME: &str = "eth0";

/// Kernel limit on interface names (IFNAMSIZ minus the NUL terminator).
const IFNAME_MAX_LEN: usize = 15;

/// The main routing table, where default routes live.
const RT_TABLE_MAIN: u8 = 254;

/// The sysctl that enables IPv4 forwarding between interfaces.
const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Manages the host bridge, NAT rules, and per-container veth wiring.
///
/// Host-side setup is idempotent: every step checks for existing state (or
/// tolerates `EEXIST`), so repeated launches converge on the same bridge and
/// rule set.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    /// Name of the bridge device.
    bridge_name: String,

    /// Bridge address and subnet; the address doubles as the container gateway.
    bridge_cidr: Ipv4Network,
}

/// The network endpoint handed to a container.
#[derive(Debug, Clone)]
pub struct NetEndpoint {
    /// The veth end left on the host bridge.
    pub host_name: String,

    /// The interface name inside the container.
    pub peer_name: String,

    /// The container's address and prefix.
    pub cidr: Ipv4Network,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkManager {
    /// Creates a new network manager from the runtime configuration.
    pub fn new(config: &CaskConfig) -> Self {
        Self {
            bridge_name: config.bridge_name.clone(),
            bridge_cidr: config.bridge_cidr,
        }
    }

    /// The gateway address containers route through (the bridge IP).
    pub fn gateway(&self) -> Ipv4Addr {
        self.bridge_cidr.ip()
    }

    /// Performs the once-per-host setup: IPv4 forwarding, bridge device with
    /// address, and the NAT/forwarding rules toward the default outbound
    /// interface. Safe to run before every launch.
    pub async fn setup_host(&self) -> CaskResult<()> {
        fs::write(IP_FORWARD_SYSCTL, "1").await?;

        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let bridge_index = self.ensure_bridge(&handle).await?;
        self.ensure_bridge_address(&handle, bridge_index).await?;
        handle.link().set(bridge_index).up().execute().await?;

        let public_iface = find_default_interface(&handle).await?;
        tracing::debug!(%public_iface, "discovered default outbound interface");

        firewall::ensure_host_rules(&self.bridge_name, &self.bridge_cidr, &public_iface).await?;

        tracing::info!(bridge = %self.bridge_name, "host networking ready");
        Ok(())
    }

    /// Wires a container into the bridge network.
    ///
    /// Creates the `vh-<suffix>`/`vc-<suffix>` pair, attaches the host end to
    /// the bridge, moves the peer into the network namespace of `pid`, and —
    /// inside that namespace — renames it to `eth0`, addresses it, brings it
    /// (and loopback) up, and adds the default route via the bridge.
    ///
    /// The target process must already have unshared its network namespace;
    /// the caller must not let it proceed to network use until this returns.
    pub async fn wire_container(
        &self,
        pid: Pid,
        cidr: Ipv4Network,
        suffix: &str,
    ) -> CaskResult<NetEndpoint> {
        let (host_name, peer_name) = veth_names(suffix)?;
        tracing::debug!(%host_name, %peer_name, %pid, "wiring container network");

        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        handle
            .link()
            .add()
            .veth(host_name.clone(), peer_name.clone())
            .execute()
            .await?;

        let host_index = link_index(&handle, &host_name)
            .await?
            .ok_or_else(|| CaskError::Network(format!("veth {} vanished", host_name)))?;
        let bridge_index = link_index(&handle, &self.bridge_name)
            .await?
            .ok_or_else(|| {
                CaskError::Network(format!("bridge {} does not exist", self.bridge_name))
            })?;

        handle
            .link()
            .set(host_index)
            .master(bridge_index)
            .execute()
            .await?;
        handle.link().set(host_index).up().execute().await?;

        let peer_index = link_index(&handle, &peer_name)
            .await?
            .ok_or_else(|| CaskError::Network(format!("veth {} vanished", peer_name)))?;
        handle
            .link()
            .set(peer_index)
            .setns_by_pid(pid.as_raw() as u32)
            .execute()
            .await?;

        let gateway = self.gateway();
        let peer = peer_name.clone();
        tokio::task::spawn_blocking(move || {
            network::run_in_netns(pid, move |ns_handle| {
                Box::pin(async move {
                    configure_container_interface(&ns_handle, &peer, cidr, gateway).await
                })
            })
        })
        .await??;

        Ok(NetEndpoint {
            host_name,
            peer_name: CONTAINER_IFNAME.to_string(),
            cidr,
        })
    }

    /// Deletes the host-side veth endpoint if it still exists. The kernel
    /// removes the pair together with the container's namespace in the normal
    /// path; this covers launches that failed before the move.
    pub async fn remove_host_endpoint(&self, suffix: &str) -> CaskResult<()> {
        let (host_name, _) = veth_names(suffix)?;

        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        if let Some(index) = link_index(&handle, &host_name).await? {
            handle.link().del(index).execute().await?;
            tracing::debug!(%host_name, "removed host veth endpoint");
        }
        Ok(())
    }

    /// Returns the bridge index, creating the device when absent. A racing
    /// `EEXIST` from the kernel counts as success.
    async fn ensure_bridge(&self, handle: &Handle) -> CaskResult<u32> {
        if let Some(index) = link_index(handle, &self.bridge_name).await? {
            return Ok(index);
        }

        tracing::info!(bridge = %self.bridge_name, "creating bridge device");
        match handle
            .link()
            .add()
            .bridge(self.bridge_name.clone())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {}
            Err(e) => return Err(e.into()),
        }

        link_index(handle, &self.bridge_name)
            .await?
            .ok_or_else(|| {
                CaskError::Network(format!("bridge {} missing after creation", self.bridge_name))
            })
    }

    /// Assigns the bridge address unless an interface address already matches.
    async fn ensure_bridge_address(&self, handle: &Handle, bridge_index: u32) -> CaskResult<()> {
        let wanted = IpAddr::V4(self.bridge_cidr.ip());

        let mut addresses = handle
            .address()
            .get()
            .set_link_index_filter(bridge_index)
            .execute();
        while let Some(message) = addresses.try_next().await? {
            for attribute in &message.attributes {
                if let AddressAttribute::Address(address) = attribute {
                    if *address == wanted {
                        tracing::debug!(%address, "bridge address already assigned");
                        return Ok(());
                    }
                }
            }
        }

        match handle
            .address()
            .add(bridge_index, wanted, self.bridge_cidr.prefix())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Configures the moved veth peer from inside the container's namespace:
/// rename to `eth0`, address, link up (plus loopback), default route via the
/// gateway.
async fn configure_container_interface(
    handle: &Handle,
    peer_name: &str,
    cidr: Ipv4Network,
    gateway: Ipv4Addr,
) -> CaskResult<()> {
    let index = link_index(handle, peer_name)
        .await?
        .ok_or_else(|| CaskError::Network(format!("{} not found in namespace", peer_name)))?;

    handle
        .link()
        .set(index)
        .name(CONTAINER_IFNAME.to_string())
        .execute()
        .await?;
    handle
        .address()
        .add(index, IpAddr::V4(cidr.ip()), cidr.prefix())
        .execute()
        .await?;
    handle.link().set(index).up().execute().await?;

    if let Some(lo_index) = link_index(handle, "lo").await? {
        handle.link().set(lo_index).up().execute().await?;
    }

    handle
        .route()
        .add()
        .v4()
        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
        .gateway(gateway)
        .execute()
        .await?;

    Ok(())
}

/// Looks up a link index by name, mapping "no such device" to `None`.
async fn link_index(handle: &Handle, name: &str) -> CaskResult<Option<u32>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Discovers the default outbound interface: the lowest-metric IPv4 default
/// route in the main table, resolved to its output interface's name.
async fn find_default_interface(handle: &Handle) -> CaskResult<String> {
    let mut routes = handle.route().get(IpVersion::V4).execute();
    let mut best: Option<(u32, u32)> = None;

    while let Some(route) = routes.try_next().await? {
        if route.header.destination_prefix_length != 0 || route.header.table != RT_TABLE_MAIN {
            continue;
        }

        let mut oif = None;
        let mut metric = 0u32;
        for attribute in &route.attributes {
            match attribute {
                RouteAttribute::Oif(index) => oif = Some(*index),
                RouteAttribute::Priority(priority) => metric = *priority,
                _ => {}
            }
        }

        if let Some(oif) = oif {
            if best.map_or(true, |(m, _)| metric < m) {
                best = Some((metric, oif));
            }
        }
    }

    let (_, oif) = best.ok_or(CaskError::NoDefaultRoute)?;

    let mut links = handle.link().get().match_index(oif).execute();
    let link = links.try_next().await?.ok_or(CaskError::NoDefaultRoute)?;
    for attribute in &link.attributes {
        if let LinkAttribute::IfName(name) = attribute {
            return Ok(name.clone());
        }
    }

    Err(CaskError::NoDefaultRoute)
}

/// Builds the veth pair names for a suffix, enforcing the kernel's
/// interface-name limit on both.
pub fn veth_names(suffix: &str) -> CaskResult<(String, String)> {
    let host_name = format!("{}{}", VETH_HOST_PREFIX, suffix);
    let peer_name = format!("{}{}", VETH_PEER_PREFIX, suffix);

    for name in [&host_name, &peer_name] {
        if name.len() > IFNAME_MAX_LEN {
            return Err(CaskError::InterfaceNameTooLong(name.clone()));
        }
    }

    Ok((host_name, peer_name))
}

/// Mints a random veth suffix: 8 hex chars, unique enough for concurrent
/// launches and short enough for IFNAMSIZ.
pub fn mint_veth_suffix() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 4]>())
}

/// Mints a container address inside the bridge subnet: a random host part in
/// `[2, size-2]`, never the gateway's.
pub fn mint_container_cidr(bridge_cidr: &Ipv4Network) -> CaskResult<Ipv4Network> {
    let size = bridge_cidr.size();
    if size < 8 {
        return Err(CaskError::Network(format!(
            "bridge subnet {} too small to allocate container addresses",
            bridge_cidr
        )));
    }

    let network = u32::from(bridge_cidr.network());
    let gateway_host = u32::from(bridge_cidr.ip()) - network;

    let mut rng = rand::thread_rng();
    let host = loop {
        let candidate = rng.gen_range(2..size - 1);
        if candidate != gateway_host {
            break candidate;
        }
    };

    Ipv4Network::new(Ipv4Addr::from(network + host), bridge_cidr.prefix())
        .map_err(CaskError::InvalidCidr)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
