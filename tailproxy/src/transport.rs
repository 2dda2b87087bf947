use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream over the overlay.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayStream for T {}

pub type BoxedStream = Box<dyn OverlayStream>;

#[async_trait]
pub trait OverlayListener: Send + Sync {
    async fn accept(&self) -> Result<BoxedStream>;
}

/// The mesh node's dial/listen capability, shaped like a plain TCP
/// facility. The SOCKS5 server and the export manager only ever see this
/// trait, so tests can substitute an in-memory transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, target: &str) -> Result<BoxedStream>;
    async fn listen(&self, port: u16) -> Result<Box<dyn OverlayListener>>;
}
