use crate::policy::PortPolicy;
use crate::transport::{BoxedStream, OverlayListener, Transport};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Mirrors child listeners as overlay listeners, keyed by port and
/// reference counted across duplicate LISTEN messages.
pub struct ExporterManager {
    transport: Arc<dyn Transport>,
    policy: PortPolicy,
    export_max: usize,
    verbose: bool,
    exporters: Mutex<HashMap<u16, PortExporter>>,
}

struct PortExporter {
    refcount: usize,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ControlCommand {
    Listen,
    Close,
}

impl ExporterManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: PortPolicy,
        export_max: usize,
        verbose: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            policy,
            export_max,
            verbose,
            exporters: Mutex::new(HashMap::new()),
        })
    }

    /// Binds the control socket with owner-only permissions and returns
    /// the listener for `run_control_socket`.
    pub fn bind_control_socket(socket_path: &Path) -> Result<UnixListener> {
        let _ = std::fs::remove_file(socket_path);
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create control socket directory {}", parent.display())
                })?;
            }
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!("failed to restrict control socket {}", socket_path.display())
            })?;
        Ok(listener)
    }

    pub async fn run_control_socket(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            match accepted {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.handle_control_connection(stream).await;
                    });
                }
                Err(err) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if self.verbose {
                        eprintln!("control socket accept error: {}", err);
                    }
                }
            }
        }
        self.shutdown_all().await;
        Ok(())
    }

    async fn handle_control_connection(self: &Arc<Self>, stream: UnixStream) {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_control_line(&line) {
                Some((ControlCommand::Listen, port)) => self.handle_listen(port).await,
                Some((ControlCommand::Close, port)) => self.handle_close(port).await,
                None => {
                    if self.verbose && !line.trim().is_empty() {
                        eprintln!("ignoring control message: {}", line.trim_end());
                    }
                }
            }
        }
    }

    async fn handle_listen(self: &Arc<Self>, port: u16) {
        if !self.policy.allows(port) {
            if self.verbose {
                eprintln!("port {} not allowed by export policy", port);
            }
            return;
        }

        let mut exporters = self.exporters.lock().await;
        if let Some(entry) = exporters.get_mut(&port) {
            entry.refcount += 1;
            if self.verbose {
                eprintln!("port {} already exported, refcount now {}", port, entry.refcount);
            }
            return;
        }
        if exporters.len() >= self.export_max {
            if self.verbose {
                eprintln!(
                    "cannot export port {}: max exports ({}) reached",
                    port, self.export_max
                );
            }
            return;
        }

        let listener = match self.transport.listen(port).await {
            Ok(listener) => listener,
            Err(err) => {
                eprintln!("failed to export port {}: {}", port, err);
                return;
            }
        };
        if self.verbose {
            eprintln!("exporting port {} on the overlay", port);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let worker = tokio::spawn(async move {
            manager.accept_loop(listener, port, shutdown_rx).await;
        });
        exporters.insert(
            port,
            PortExporter {
                refcount: 1,
                shutdown: shutdown_tx,
                worker,
            },
        );
    }

    async fn handle_close(&self, port: u16) {
        let removed = {
            let mut exporters = self.exporters.lock().await;
            match exporters.get_mut(&port) {
                None => return,
                Some(entry) => {
                    entry.refcount -= 1;
                    if self.verbose {
                        eprintln!("port {} refcount decreased to {}", port, entry.refcount);
                    }
                    if entry.refcount > 0 {
                        return;
                    }
                    exporters.remove(&port)
                }
            }
        };
        if let Some(entry) = removed {
            if self.verbose {
                eprintln!("stopping export of port {}", port);
            }
            let _ = entry.shutdown.send(true);
            let _ = entry.worker.await;
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: Box<dyn OverlayListener>,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => return,
            };
            match accepted {
                Ok(stream) => {
                    let verbose = self.verbose;
                    tokio::spawn(async move {
                        forward_connection(stream, port, verbose).await;
                    });
                }
                Err(err) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    if self.verbose {
                        eprintln!("accept error on exported port {}: {}", port, err);
                    }
                }
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<(u16, PortExporter)> = {
            let mut exporters = self.exporters.lock().await;
            exporters.drain().collect()
        };
        for (port, entry) in drained {
            if self.verbose {
                eprintln!("stopping export of port {}", port);
            }
            let _ = entry.shutdown.send(true);
            let _ = entry.worker.await;
        }
    }

    #[cfg(test)]
    async fn exported_ports(&self) -> Vec<u16> {
        let exporters = self.exporters.lock().await;
        let mut ports: Vec<u16> = exporters.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

// Half-close propagation comes from copy_bidirectional: when one copy sees
// EOF it shuts down the opposite write side.
async fn forward_connection(mut overlay: BoxedStream, port: u16, verbose: bool) {
    let mut local = match dial_loopback(port).await {
        Ok(local) => local,
        Err(err) => {
            if verbose {
                eprintln!("failed to connect to local port {}: {}", port, err);
            }
            return;
        }
    };
    if verbose {
        eprintln!("forwarding overlay connection to local port {}", port);
    }
    let _ = tokio::io::copy_bidirectional(&mut overlay, &mut local).await;
}

async fn dial_loopback(port: u16) -> Result<TcpStream> {
    match TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
        Ok(stream) => Ok(stream),
        Err(_) => TcpStream::connect(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
            .await
            .context("loopback dial failed on both families"),
    }
}

fn parse_control_line(line: &str) -> Option<(ControlCommand, u16)> {
    let mut fields = line.split_whitespace();
    let cmd = fields.next()?;
    let family = fields.next()?;
    let port = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    if family != "tcp4" && family != "tcp6" {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    let cmd = match cmd {
        "LISTEN" => ControlCommand::Listen,
        "CLOSE" => ControlCommand::Close,
        _ => return None,
    };
    Some((cmd, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn manager_with(
        transport: Arc<MemoryTransport>,
        allow: &str,
        deny: &str,
        export_max: usize,
    ) -> Arc<ExporterManager> {
        let policy = PortPolicy::from_specs(allow, deny).expect("policy");
        ExporterManager::new(transport, policy, export_max, false)
    }

    #[tokio::test]
    async fn listen_then_close_leaves_no_entry() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(Arc::clone(&transport), "", "", 32);

        for _ in 0..3 {
            manager.handle_listen(18090).await;
        }
        assert_eq!(manager.exported_ports().await, vec![18090]);
        assert_eq!(transport.listener_count(), 1);

        for _ in 0..3 {
            manager.handle_close(18090).await;
        }
        assert!(manager.exported_ports().await.is_empty());
        assert!(!transport.has_listener(18090));
    }

    #[tokio::test]
    async fn policy_rejection_creates_no_listener() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(Arc::clone(&transport), "3000,8080-8100", "", 32);

        manager.handle_listen(9000).await;
        assert!(manager.exported_ports().await.is_empty());
        assert_eq!(transport.listener_count(), 0);

        manager.handle_listen(8080).await;
        assert_eq!(manager.exported_ports().await, vec![8080]);
        manager.handle_close(8080).await;
    }

    #[tokio::test]
    async fn cap_is_enforced_until_a_port_frees_up() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(Arc::clone(&transport), "", "", 2);

        manager.handle_listen(7001).await;
        manager.handle_listen(7002).await;
        manager.handle_listen(7003).await;
        assert_eq!(manager.exported_ports().await, vec![7001, 7002]);

        manager.handle_close(7001).await;
        manager.handle_listen(7003).await;
        assert_eq!(manager.exported_ports().await, vec![7002, 7003]);

        manager.shutdown_all().await;
        assert!(manager.exported_ports().await.is_empty());
    }

    #[tokio::test]
    async fn close_for_unknown_port_is_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport, "", "", 32);
        manager.handle_close(12345).await;
        assert!(manager.exported_ports().await.is_empty());
    }

    #[tokio::test]
    async fn overlay_connection_reaches_the_loopback_service() {
        // A real loopback echo stands in for the child's server.
        let child = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = child.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (mut conn, _) = child.accept().await.expect("accept");
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.expect("read");
            conn.write_all(&buf).await.expect("write");
        });

        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(Arc::clone(&transport), "", "", 32);
        manager.handle_listen(port).await;

        let mut overlay = transport.connect_overlay(port).expect("overlay connect");
        overlay.write_all(b"hello").await.expect("send");
        let mut buf = [0u8; 5];
        overlay.read_exact(&mut buf).await.expect("recv");
        assert_eq!(&buf, b"hello");

        manager.handle_close(port).await;
    }

    #[test]
    fn control_lines_parse_and_malformed_lines_skip() {
        assert_eq!(
            parse_control_line("LISTEN tcp4 8080"),
            Some((ControlCommand::Listen, 8080))
        );
        assert_eq!(
            parse_control_line("CLOSE tcp6 443"),
            Some((ControlCommand::Close, 443))
        );
        assert_eq!(parse_control_line("LISTEN tcp4"), None);
        assert_eq!(parse_control_line("LISTEN udp4 8080"), None);
        assert_eq!(parse_control_line("LISTEN tcp4 notaport"), None);
        assert_eq!(parse_control_line("FROB tcp4 8080"), None);
        assert_eq!(parse_control_line(""), None);
        assert_eq!(parse_control_line("LISTEN tcp4 8080 extra"), None);
    }
}
