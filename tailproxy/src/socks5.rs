use crate::transport::Transport;
use anyhow::{anyhow, Result};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// The three RFC 1928 address forms; anything else is rejected at the
/// framing boundary.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DestAddr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestAddr::V4(ip) => write!(f, "{}", ip),
            DestAddr::Domain(name) => write!(f, "{}", name),
            DestAddr::V6(ip) => write!(f, "{}", ip),
        }
    }
}

impl DestAddr {
    /// Joined `host:port` form handed to the transport; IPv6 is bracketed.
    pub fn join(&self, port: u16) -> String {
        match self {
            DestAddr::V6(ip) => format!("[{}]:{}", ip, port),
            other => format!("{}:{}", other, port),
        }
    }
}

pub struct Socks5Server {
    transport: Arc<dyn Transport>,
    verbose: bool,
}

impl Socks5Server {
    pub fn new(transport: Arc<dyn Transport>, verbose: bool) -> Arc<Self> {
        Arc::new(Self { transport, verbose })
    }

    /// Accept loop over an already-bound loopback listener. The caller
    /// binds first so readiness can be signalled before the first accept.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => return Ok(()),
            };
            match accepted {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            if server.verbose {
                                eprintln!("socks5 session ended: {}", err);
                            }
                        }
                    });
                }
                Err(err) => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    if self.verbose {
                        eprintln!("socks5 accept error: {}", err);
                    }
                }
            }
        }
    }

    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        // Greeting: version, method count, then that many methods.
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(anyhow!("unsupported socks version {}", head[0]));
        }
        let mut methods = vec![0u8; usize::from(head[1])];
        stream.read_exact(&mut methods).await?;
        stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

        // Request: VER CMD RSV ATYP.
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS5_VERSION {
            return Err(anyhow!("unsupported socks version {}", request[0]));
        }
        if request[1] != CMD_CONNECT {
            write_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(anyhow!("unsupported socks command {}", request[1]));
        }

        let dest = match read_dest_addr(&mut stream, request[3]).await? {
            Some(dest) => dest,
            None => {
                write_reply(&mut stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
                return Err(anyhow!("unsupported address type {}", request[3]));
            }
        };
        let mut port_bytes = [0u8; 2];
        stream.read_exact(&mut port_bytes).await?;
        let target = dest.join(u16::from_be_bytes(port_bytes));

        if self.verbose {
            eprintln!("socks5 connect to {}", target);
        }

        let mut remote = match self.transport.dial(&target).await {
            Ok(remote) => remote,
            Err(err) => {
                write_reply(&mut stream, REPLY_CONNECTION_REFUSED).await?;
                return Err(anyhow!("dial {} failed: {}", target, err));
            }
        };
        write_reply(&mut stream, REPLY_SUCCEEDED).await?;

        let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
        Ok(())
    }
}

async fn read_dest_addr<S>(stream: &mut S, atyp: u8) -> Result<Option<DestAddr>>
where
    S: AsyncRead + Send + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(Some(DestAddr::V4(Ipv4Addr::from(octets))))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name).await?;
            Ok(Some(DestAddr::Domain(
                String::from_utf8_lossy(&name).into_owned(),
            )))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(Some(DestAddr::V6(Ipv6Addr::from(octets))))
        }
        _ => Ok(None),
    }
}

// The client ignores the BND fields, so they are zeroed.
async fn write_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    async fn greet<S>(client: &mut S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        client
            .write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH])
            .await
            .expect("greeting");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.expect("method reply");
        assert_eq!(reply, [SOCKS5_VERSION, METHOD_NO_AUTH]);
    }

    async fn read_reply<S>(client: &mut S) -> u8
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply[0], SOCKS5_VERSION);
        reply[1]
    }

    #[tokio::test]
    async fn connect_proxies_bytes_both_ways() {
        let transport = Arc::new(MemoryTransport::new());
        let mut incoming = transport.register_remote("203.0.113.9:80");
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        greet(&mut client).await;
        client
            .write_all(&[
                SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 203, 0, 113, 9, 0x00, 0x50,
            ])
            .await
            .expect("request");
        assert_eq!(read_reply(&mut client).await, REPLY_SUCCEEDED);

        let mut remote = incoming.recv().await.expect("remote end");
        client.write_all(b"ping").await.expect("send");
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.expect("remote recv");
        assert_eq!(&buf, b"ping");
        remote.write_all(b"pong").await.expect("remote send");
        client.read_exact(&mut buf).await.expect("recv");
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(remote);
        session.await.expect("join").expect("session");
    }

    #[tokio::test]
    async fn domain_request_reaches_transport_joined() {
        let transport = Arc::new(MemoryTransport::new());
        let mut incoming = transport.register_remote("origin.example:8080");
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        greet(&mut client).await;
        let name = b"origin.example";
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, name.len() as u8];
        request.extend_from_slice(name);
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.expect("request");
        assert_eq!(read_reply(&mut client).await, REPLY_SUCCEEDED);
        assert!(incoming.recv().await.is_some());

        drop(client);
        session.await.expect("join").expect("session");
    }

    #[tokio::test]
    async fn dial_failure_replies_connection_refused() {
        let transport = Arc::new(MemoryTransport::new());
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        greet(&mut client).await;
        client
            .write_all(&[
                SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 203, 0, 113, 9, 0x00, 0x50,
            ])
            .await
            .expect("request");
        assert_eq!(read_reply(&mut client).await, REPLY_CONNECTION_REFUSED);
        assert!(session.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn non_connect_command_is_refused() {
        let transport = Arc::new(MemoryTransport::new());
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        greet(&mut client).await;
        client
            .write_all(&[
                SOCKS5_VERSION, 0x02, 0x00, ATYP_IPV4, 203, 0, 113, 9, 0x00, 0x50,
            ])
            .await
            .expect("request");
        assert_eq!(read_reply(&mut client).await, REPLY_COMMAND_NOT_SUPPORTED);
        assert!(session.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn unknown_address_type_is_refused() {
        let transport = Arc::new(MemoryTransport::new());
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        greet(&mut client).await;
        client
            .write_all(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, 0x09])
            .await
            .expect("request");
        assert_eq!(
            read_reply(&mut client).await,
            REPLY_ADDRESS_TYPE_NOT_SUPPORTED
        );
        assert!(session.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn wrong_version_greeting_drops_the_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let server = Socks5Server::new(transport, false);

        let (mut client, server_end) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { server.handle_connection(server_end).await });

        client.write_all(&[0x04, 0x01]).await.expect("greeting");
        assert!(session.await.expect("join").is_err());
        // No reply was written before the drop.
        let mut buf = [0u8; 1];
        let read = client.read(&mut buf).await.expect("eof");
        assert_eq!(read, 0);
    }

    #[test]
    fn v6_targets_are_bracketed() {
        let dest = DestAddr::V6("fd7a::2".parse().expect("addr"));
        assert_eq!(dest.join(443), "[fd7a::2]:443");
        let dest = DestAddr::V4("203.0.113.9".parse().expect("addr"));
        assert_eq!(dest.join(80), "203.0.113.9:80");
        let dest = DestAddr::Domain("origin.example".into());
        assert_eq!(dest.join(8080), "origin.example:8080");
    }
}
