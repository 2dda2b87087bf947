use crate::control::ControlClient;
use crate::keys;
use crate::model::{NetMap, PeerInfo, RegisterRequest, RegisterUrlRequest};
use crate::state::{self, NodeState};
use crate::transport::{BoxedStream, OverlayListener, Transport};
use crate::wg;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

const APPROVAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The embedded overlay node: a persistent WireGuard identity, a control
/// plane session, and the dial/listen capability the proxy halves consume.
pub struct MeshNode {
    hostname: String,
    control_url: String,
    auth_secret: Option<String>,
    verbose: bool,
    interface: String,
    backend: wg::Backend,
    state_path: PathBuf,
    state: Option<NodeState>,
}

impl MeshNode {
    pub fn new(
        hostname: &str,
        control_url: &str,
        auth_secret: Option<String>,
        backend: wg::Backend,
        verbose: bool,
    ) -> Result<Self> {
        let state_dir = state::ensure_state_dir(hostname)?;
        Ok(Self {
            hostname: hostname.to_string(),
            control_url: control_url.to_string(),
            auth_secret,
            verbose,
            interface: wg::interface_name(hostname),
            backend,
            state_path: state::node_state_path(&state_dir),
            state: None,
        })
    }

    /// Brings the node online: authenticate (or reuse the persisted
    /// identity), fetch the netmap, and program the WireGuard interface.
    /// Blocks until the backend is running; interactive authentication
    /// prints its URL to stderr exactly once and polls until approved.
    pub async fn up(&mut self) -> Result<()> {
        let mut node_state = match state::load_state(&self.state_path)? {
            Some(existing) => self.refresh(existing).await?,
            None => self.authenticate().await?,
        };

        let netmap = node_state
            .last_netmap
            .clone()
            .ok_or_else(|| anyhow!("control plane returned no netmap"))?;
        node_state.ipv4 = netmap.node.ipv4.clone();
        node_state.ipv6 = netmap.node.ipv6.clone();
        node_state.updated_at = now_unix();
        state::save_state(&self.state_path, &node_state)?;

        let wg_cfg = self.wg_config();
        wg::apply(&netmap, &node_state, &wg_cfg, None)
            .await
            .context("wireguard apply failed")?;
        if self.verbose {
            eprintln!(
                "overlay up: node {} at {} on {}",
                node_state.node_id, node_state.ipv4, self.interface
            );
        }
        self.state = Some(node_state);
        Ok(())
    }

    async fn authenticate(&self) -> Result<NodeState> {
        let wg_keys = keys::generate_wg_keys();
        let client = ControlClient::new(&self.control_url, None)?;

        if let Some(secret) = self.auth_secret.as_deref() {
            let response = client
                .register(RegisterRequest {
                    token: secret.to_string(),
                    node_name: self.hostname.clone(),
                    wg_public_key: wg_keys.public_key.clone(),
                })
                .await
                .context("authentication failed")?;
            let netmap = response.netmap;
            return Ok(NodeState {
                node_id: netmap.node.id.clone(),
                node_name: self.hostname.clone(),
                wg_private_key: wg_keys.private_key,
                wg_public_key: wg_keys.public_key,
                node_token: Some(response.node_token),
                ipv4: netmap.node.ipv4.clone(),
                ipv6: netmap.node.ipv6.clone(),
                last_netmap: Some(netmap),
                updated_at: now_unix(),
            });
        }

        let response = client
            .register_url(RegisterUrlRequest {
                node_name: self.hostname.clone(),
                wg_public_key: wg_keys.public_key.clone(),
            })
            .await
            .context("authentication failed")?;
        eprintln!(
            "\nTo authenticate, visit:\n\n\t{}\n",
            client.auth_url(&response.auth_path)
        );

        let mut node_state = NodeState {
            node_id: response.node_id,
            node_name: self.hostname.clone(),
            wg_private_key: wg_keys.private_key,
            wg_public_key: wg_keys.public_key,
            node_token: Some(response.node_token),
            ipv4: response.ipv4,
            ipv6: response.ipv6,
            last_netmap: None,
            updated_at: now_unix(),
        };
        self.poll_until_approved(&mut node_state).await?;
        Ok(node_state)
    }

    async fn refresh(&self, mut node_state: NodeState) -> Result<NodeState> {
        let wg_keys = keys::wg_keys_from_private_base64(&node_state.wg_private_key)
            .context("persisted node state is corrupt")?;
        node_state.wg_public_key = wg_keys.public_key;
        let client = ControlClient::new(&self.control_url, node_state.node_token.clone())?;
        match client.netmap(&node_state.node_id).await {
            Ok(netmap) => {
                node_state.last_netmap = Some(netmap);
            }
            Err(err) => {
                // A stale netmap still brings the overlay up; the control
                // plane may be reachable only through it.
                if node_state.last_netmap.is_none() {
                    return Err(err).context("netmap fetch failed");
                }
                if self.verbose {
                    eprintln!("netmap refresh failed, using cached copy: {}", err);
                }
            }
        }
        if let Some(netmap) = node_state.last_netmap.as_ref() {
            if !netmap.node.approved {
                self.poll_until_approved(&mut node_state).await?;
            }
        }
        Ok(node_state)
    }

    async fn poll_until_approved(&self, node_state: &mut NodeState) -> Result<()> {
        let client = ControlClient::new(&self.control_url, node_state.node_token.clone())?;
        loop {
            match client.netmap(&node_state.node_id).await {
                Ok(netmap) => {
                    let approved = netmap.node.approved;
                    node_state.last_netmap = Some(netmap);
                    node_state.updated_at = now_unix();
                    state::save_state(&self.state_path, node_state)?;
                    if approved {
                        return Ok(());
                    }
                }
                Err(err) => {
                    if self.verbose {
                        eprintln!("status poll failed: {}", err);
                    }
                }
            }
            sleep(APPROVAL_POLL_INTERVAL).await;
        }
    }

    /// Routes dial-outs through the named peer. The peer is located by
    /// host name, DNS name, or any of its overlay addresses.
    pub async fn set_exit_relay(&self, name_or_ip: &str) -> Result<()> {
        let node_state = self
            .state
            .as_ref()
            .ok_or_else(|| anyhow!("mesh node is not up"))?;
        let netmap = node_state
            .last_netmap
            .as_ref()
            .ok_or_else(|| anyhow!("mesh node has no netmap"))?;
        let peer = find_peer(netmap, name_or_ip)
            .ok_or_else(|| anyhow!("exit relay {} not found", name_or_ip))?;
        let peer_id = peer.id.clone();
        if self.verbose {
            eprintln!("exit relay {} at {}", peer.name, peer.ipv4);
        }

        let wg_cfg = self.wg_config();
        wg::apply(netmap, node_state, &wg_cfg, Some(&peer_id))
            .await
            .context("exit relay apply failed")?;
        Ok(())
    }

    pub async fn down(&self) {
        if self.state.is_some() {
            if let Err(err) = wg::remove(&self.interface, self.backend).await {
                eprintln!("failed to remove {}: {}", self.interface, err);
            }
        }
    }

    pub fn overlay_ipv4(&self) -> Result<Ipv4Addr> {
        let node_state = self
            .state
            .as_ref()
            .ok_or_else(|| anyhow!("mesh node is not up"))?;
        node_state
            .ipv4
            .parse()
            .context("invalid overlay ipv4 address")
    }

    fn wg_config(&self) -> wg::WgConfig {
        wg::WgConfig {
            interface: self.interface.clone(),
            // Port 0 lets the kernel pick; peers learn it from the control
            // plane's endpoint discovery.
            listen_port: 0,
            backend: self.backend,
        }
    }

    fn resolve_host(&self, host: &str) -> Option<IpAddr> {
        let netmap = self.state.as_ref()?.last_netmap.as_ref()?;
        let peer = find_peer(netmap, host)?;
        peer.ipv4.parse().ok()
    }
}

#[async_trait]
impl Transport for MeshNode {
    async fn dial(&self, target: &str) -> Result<BoxedStream> {
        let (host, port) = split_host_port(target)?;
        let stream = if let Ok(ip) = host.parse::<IpAddr>() {
            TcpStream::connect(SocketAddr::new(ip, port)).await
        } else if let Some(ip) = self.resolve_host(&host) {
            // Peer names resolve against the netmap before the system
            // resolver sees them.
            TcpStream::connect(SocketAddr::new(ip, port)).await
        } else {
            TcpStream::connect((host.as_str(), port)).await
        };
        let stream = stream.with_context(|| format!("dial {} failed", target))?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, port: u16) -> Result<Box<dyn OverlayListener>> {
        let addr = SocketAddr::new(IpAddr::V4(self.overlay_ipv4()?), port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("overlay listen on {} failed", addr))?;
        Ok(Box::new(MeshListener { listener }))
    }
}

struct MeshListener {
    listener: TcpListener,
}

#[async_trait]
impl OverlayListener for MeshListener {
    async fn accept(&self) -> Result<BoxedStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }
}

fn find_peer<'a>(netmap: &'a NetMap, needle: &str) -> Option<&'a PeerInfo> {
    let suffixed = format!("{}.{}", needle, netmap.network.dns_domain);
    netmap.peers.iter().find(|peer| {
        peer.name == needle
            || peer.dns_name == needle
            || peer.dns_name == suffixed
            || peer.ipv4 == needle
            || peer.ipv6 == needle
    })
}

fn split_host_port(target: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid target {}", target))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("invalid target {}", target))?;
        (host.to_string(), port)
    } else {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("invalid target {}", target))?;
        (host.to_string(), port)
    };
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid port in target {}", target))?;
    Ok((host, port))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
