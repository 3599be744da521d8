//! TCP connections to the device.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};

use super::item::PoolItem;

/// Default time allowed for a TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A buffered TCP connection to the device.
///
/// Reads go through an internal buffer so the length prefix and body of a
/// frame do not each cost a syscall.
pub struct DeviceConnection {
    stream: BufStream<TcpStream>,
    peer: SocketAddr,
}

impl DeviceConnection {
    /// Open a connection, failing with [`BrokerError::ConnectTimeout`] if it
    /// does not complete within `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is refused or times out.
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(address, error = %e, "failed to connect to device");
                return Err(BrokerError::Connection(e));
            }
            Err(_) => {
                warn!(address, "device connect timeout");
                return Err(BrokerError::ConnectTimeout {
                    address: address.to_string(),
                });
            }
        };

        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "device connection established");

        Ok(Self {
            stream: BufStream::new(stream),
            peer,
        })
    }

    /// Address of the device this connection talks to.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for DeviceConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DeviceConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl PoolItem for DeviceConnection {
    fn close(mut self) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            self.stream.shutdown().await?;
            debug!(peer = %self.peer, "device connection closed");
            Ok(())
        }
    }
}

/// Build a pool factory that opens [`DeviceConnection`]s to `address`.
pub fn tcp_factory(
    address: impl Into<String>,
    connect_timeout: Duration,
) -> impl Fn() -> BoxFuture<'static, Result<DeviceConnection>> + Send + Sync + 'static {
    let address: Arc<str> = Arc::from(address.into());
    move || {
        let address = Arc::clone(&address);
        async move { DeviceConnection::connect(&address, connect_timeout).await }.boxed()
    }
}
