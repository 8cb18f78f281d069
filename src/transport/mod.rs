//! Transport clients carrying frames between a point and the switch.
//!
//! Every transport implements the same contract: connect, read/write one
//! frame at a time, close, and report status. Byte-stream transports (TCP,
//! TLS) add the stream framing prefix; datagram transports (UDP) already
//! deliver message boundaries. Shared bookkeeping lives in [`Link`] rather
//! than being duplicated per implementation.

mod memory;
mod tcp;
mod tls;
mod udp;

pub use memory::{MemorySwitch, MemoryTransport};
pub use tcp::TcpTransport;
pub use tls::TlsTransport;
pub use udp::UdpTransport;

use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;

/// Lifecycle status of one transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Init,
    Connecting,
    Connected,
    Closed,
}

/// Observer for link lifecycle changes, set once at construction.
pub trait LinkListener: Send + Sync {
    /// The link finished connecting.
    fn on_connected(&self);
    /// The link was closed, locally or by the peer.
    fn on_closed(&self);
}

/// The contract the connection worker depends on.
///
/// Methods take `&self`: one reader task and one writer task share the same
/// transport handle, so each implementation guards its halves internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link. Replaces any previous connection.
    async fn connect(&self) -> Result<()>;

    /// Close the link and mark it [`LinkStatus::Closed`].
    async fn close(&self);

    /// Read one whole frame; blocks until a frame or an error arrives.
    async fn read_frame(&self) -> Result<Vec<u8>>;

    /// Write one whole frame.
    async fn write_frame(&self, frame: &[u8]) -> Result<()>;

    /// Current link status.
    fn status(&self) -> LinkStatus;

    /// Force the link status (used by the owner during teardown).
    fn set_status(&self, status: LinkStatus);

    /// Local socket address, once connected.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote switch address, once connected.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Register the lifecycle listener. Later calls are ignored.
    fn set_listener(&self, listener: std::sync::Arc<dyn LinkListener>);
}

/// Bookkeeping shared by every transport implementation.
///
/// Status and addresses sit behind one lock; the listener is written once
/// and never reassigned.
pub struct Link {
    status: Mutex<LinkStatus>,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    connected_at: Mutex<Option<Instant>>,
    listener: OnceLock<std::sync::Arc<dyn LinkListener>>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            status: Mutex::new(LinkStatus::Init),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            connected_at: Mutex::new(None),
            listener: OnceLock::new(),
        }
    }
}

impl Link {
    pub fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: LinkStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    /// When the current connection was established.
    pub fn connected_at(&self) -> Option<Instant> {
        *self.connected_at.lock().unwrap()
    }

    pub fn set_listener(&self, listener: std::sync::Arc<dyn LinkListener>) {
        let _ = self.listener.set(listener);
    }

    /// Record a successful connect and notify the listener.
    pub fn mark_connected(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        {
            *self.status.lock().unwrap() = LinkStatus::Connected;
            *self.local.lock().unwrap() = local;
            *self.remote.lock().unwrap() = remote;
            *self.connected_at.lock().unwrap() = Some(Instant::now());
        }
        if let Some(listener) = self.listener.get() {
            listener.on_connected();
        }
    }

    /// Record a close and notify the listener once.
    ///
    /// Idempotent: a second close while already closed is silent, so error
    /// paths and explicit teardown can both call it.
    pub fn mark_closed(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == LinkStatus::Closed {
                return;
            }
            *status = LinkStatus::Closed;
        }
        if let Some(listener) = self.listener.get() {
            listener.on_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    impl LinkListener for Counter {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_link_lifecycle_callbacks() {
        let link = Link::default();
        let counter = Arc::new(Counter {
            connected: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        link.set_listener(counter.clone());

        assert_eq!(link.status(), LinkStatus::Init);
        link.mark_connected(None, None);
        assert_eq!(link.status(), LinkStatus::Connected);
        assert_eq!(counter.connected.load(Ordering::SeqCst), 1);

        link.mark_closed();
        link.mark_closed();
        assert_eq!(link.status(), LinkStatus::Closed);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1, "close fires once");
    }

    #[test]
    fn test_listener_set_once() {
        let link = Link::default();
        let first = Arc::new(Counter {
            connected: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        let second = Arc::new(Counter {
            connected: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        link.set_listener(first.clone());
        link.set_listener(second.clone());

        link.mark_connected(None, None);
        assert_eq!(first.connected.load(Ordering::SeqCst), 1);
        assert_eq!(second.connected.load(Ordering::SeqCst), 0);
    }
}
