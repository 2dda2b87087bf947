use crate::model::{NetMap, PeerInfo};
use crate::netlink::Netlink;
use crate::state::NodeState;
use anyhow::{anyhow, Context, Result};
use boringtun::device::{DeviceConfig, DeviceHandle};
use ipnet::IpNet;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use wireguard_control::{
    Backend as WgBackend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Kernel,
    Boringtun,
}

pub struct WgConfig {
    pub interface: String,
    pub listen_port: u16,
    pub backend: Backend,
}

const LINK_WAIT: Duration = Duration::from_secs(3);
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

// Two half-space routes per family outrank the existing default route
// without replacing it, the way wg-quick programs full-tunnel configs.
const EXIT_SPLIT_PREFIXES: [&str; 4] = ["0.0.0.0/1", "128.0.0.0/1", "::/1", "8000::/1"];

// Linux caps interface names at IFNAMSIZ-1 bytes.
pub fn interface_name(hostname: &str) -> String {
    let mut name = format!("tp-{}", hostname);
    let mut cut = name.len().min(15);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name.truncate(cut);
    name
}

/// Applies the netmap to the WireGuard interface: device config, overlay
/// addresses, and per-peer host routes. When an exit relay is selected,
/// that peer's allowed-ips widen to the default routes and the split
/// default routes are installed so dial-outs egress through it.
pub async fn apply(
    netmap: &NetMap,
    state: &NodeState,
    cfg: &WgConfig,
    exit_peer_id: Option<&str>,
) -> Result<()> {
    let netlink = Netlink::open().await?;
    if cfg.backend == Backend::Boringtun {
        start_userspace_device(&cfg.interface)?;
        await_uapi_socket(&cfg.interface).await?;
    }

    let iface: InterfaceName = cfg.interface.parse().context("invalid interface name")?;
    build_device_update(netmap, state, cfg, exit_peer_id)?
        .apply(&iface, wg_backend(cfg.backend))
        .context("wireguard config apply failed")?;

    let index = netlink.await_interface(&cfg.interface, LINK_WAIT).await?;
    let v4: Ipv4Addr = state.ipv4.parse().context("invalid overlay ipv4 address")?;
    netlink.assign_address(index, IpAddr::V4(v4), 32).await?;
    let v6: Ipv6Addr = state.ipv6.parse().context("invalid overlay ipv6 address")?;
    netlink.assign_address(index, IpAddr::V6(v6), 128).await?;
    netlink.bring_up(index).await?;

    for peer in &netmap.peers {
        for net in peer_allowed_ips(peer, false)? {
            netlink.install_route(net, index).await?;
        }
    }
    if exit_peer_id.is_some() {
        for net in exit_split_routes() {
            netlink.install_route(net, index).await?;
        }
    }
    Ok(())
}

pub async fn remove(interface: &str, backend: Backend) -> Result<()> {
    let netlink = Netlink::open().await?;
    if backend == Backend::Boringtun {
        drop_userspace_device(interface);
        let _ = std::fs::remove_file(uapi_socket_path(interface));
    }
    netlink.remove_interface(interface).await
}

fn wg_backend(backend: Backend) -> WgBackend {
    match backend {
        Backend::Kernel => WgBackend::Kernel,
        Backend::Boringtun => WgBackend::Userspace,
    }
}

fn build_device_update(
    netmap: &NetMap,
    state: &NodeState,
    cfg: &WgConfig,
    exit_peer_id: Option<&str>,
) -> Result<DeviceUpdate> {
    let private_key =
        Key::from_base64(&state.wg_private_key).context("invalid wireguard private key")?;
    let mut update = DeviceUpdate::new()
        .set_private_key(private_key)
        .set_listen_port(cfg.listen_port)
        .replace_peers();

    for peer in &netmap.peers {
        let peer_key = Key::from_base64(&peer.wg_public_key)
            .with_context(|| format!("invalid public key for peer {}", peer.id))?;
        let mut builder = PeerConfigBuilder::new(&peer_key).replace_allowed_ips();
        let exit = exit_peer_id == Some(peer.id.as_str());
        for net in peer_allowed_ips(peer, exit)? {
            builder = builder.add_allowed_ip(net.network(), net.prefix_len());
        }
        match first_endpoint(peer) {
            Some(addr) => {
                builder = builder
                    .set_endpoint(addr)
                    .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);
            }
            None => {
                if !peer.endpoints.is_empty() {
                    eprintln!("no valid endpoint for peer {}", peer.id);
                }
            }
        }
        update = update.add_peer(builder);
    }

    Ok(update)
}

/// Host routes for the peer's overlay addresses; an exit relay also gets
/// the full default routes so WireGuard accepts forwarded traffic.
fn peer_allowed_ips(peer: &PeerInfo, exit: bool) -> Result<Vec<IpNet>> {
    let ipv4: IpAddr = peer.ipv4.parse().context("invalid peer ipv4")?;
    let ipv6: IpAddr = peer.ipv6.parse().context("invalid peer ipv6")?;
    let mut allowed = vec![
        IpNet::new(ipv4, 32).context("invalid peer ipv4 prefix")?,
        IpNet::new(ipv6, 128).context("invalid peer ipv6 prefix")?,
    ];
    if exit {
        allowed.push("0.0.0.0/0".parse().expect("static prefix"));
        allowed.push("::/0".parse().expect("static prefix"));
    }
    Ok(allowed)
}

fn first_endpoint(peer: &PeerInfo) -> Option<SocketAddr> {
    peer.endpoints
        .iter()
        .find_map(|endpoint| endpoint.parse().ok())
}

fn exit_split_routes() -> Vec<IpNet> {
    EXIT_SPLIT_PREFIXES
        .iter()
        .map(|prefix| prefix.parse().expect("static prefix"))
        .collect()
}

static USERSPACE_DEVICES: OnceLock<Mutex<HashMap<String, DeviceHandle>>> = OnceLock::new();

fn start_userspace_device(interface: &str) -> Result<()> {
    let devices = USERSPACE_DEVICES.get_or_init(Default::default);
    let mut devices = devices.lock().unwrap_or_else(|err| err.into_inner());
    if let Entry::Vacant(slot) = devices.entry(interface.to_string()) {
        let handle = DeviceHandle::new(interface, DeviceConfig::default())
            .context("boringtun device start failed")?;
        slot.insert(handle);
    }
    Ok(())
}

fn drop_userspace_device(interface: &str) {
    if let Some(devices) = USERSPACE_DEVICES.get() {
        devices
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(interface);
    }
}

// The device is up once its UAPI socket shows up under /var/run.
async fn await_uapi_socket(interface: &str) -> Result<()> {
    let path = uapi_socket_path(interface);
    let deadline = Instant::now() + LINK_WAIT;
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "userspace device socket {} never appeared",
                path.display()
            ));
        }
        sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn uapi_socket_path(interface: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/wireguard/{interface}.sock"))
}
