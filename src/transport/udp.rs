//! UDP datagram transport.
//!
//! Datagrams already carry message boundaries, so frames travel bare with
//! no stream framing prefix. Size bounds are still enforced on receive.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::stream::StreamCodec;
use crate::transport::{Link, LinkListener, LinkStatus, Transport};

/// Connected-UDP transport, one frame per datagram.
pub struct UdpTransport {
    addr: String,
    codec: StreamCodec,
    link: Link,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    /// Create a transport for `host:port`, not yet connected.
    pub fn new(addr: impl Into<String>, codec: StreamCodec) -> Self {
        Self {
            addr: addr.into(),
            codec,
            link: Link::default(),
            socket: Mutex::new(None),
        }
    }

    async fn current_socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self) -> Result<()> {
        self.link.set_status(LinkStatus::Connecting);
        debug!(addr = %self.addr, "udp connecting");

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                self.link.set_status(LinkStatus::Closed);
                return Err(e.into());
            }
        };
        if let Err(e) = socket.connect(&self.addr).await {
            self.link.set_status(LinkStatus::Closed);
            return Err(Error::connection(format!("UDP connect {}: {e}", self.addr)));
        }

        let local = socket.local_addr().ok();
        let remote = socket.peer_addr().ok();
        *self.socket.lock().await = Some(Arc::new(socket));

        self.link.mark_connected(local, remote);
        Ok(())
    }

    async fn close(&self) {
        self.socket.lock().await.take();
        self.link.mark_closed();
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let socket = self.current_socket().await?;
        let mut buf = vec![0u8; self.codec.max_size()];
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.link.mark_closed();
                return Err(e.into());
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let socket = self.current_socket().await?;
        if let Err(e) = socket.send(frame).await {
            self.link.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }

    fn status(&self) -> LinkStatus {
        self.link.status()
    }

    fn set_status(&self, status: LinkStatus) {
        self.link.set_status(status);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    fn set_listener(&self, listener: Arc<dyn LinkListener>) {
        self.link.set_listener(listener);
    }
}
