//! In-memory transport pair for tests and examples.
//!
//! [`MemoryTransport`] hands frames to a [`MemorySwitch`] over bounded
//! channels, with no sockets involved. The switch half can script connect
//! failures and read errors, which is what the reconnect scenarios need.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::transport::{Link, LinkListener, LinkStatus, Transport};

/// Queue depth of each direction, matching the worker write queues.
const QUEUE_DEPTH: usize = 1024;

type Inbound = std::result::Result<Vec<u8>, String>;

/// Point-side half of an in-memory link.
pub struct MemoryTransport {
    link: Link,
    to_point: Mutex<mpsc::Receiver<Inbound>>,
    from_point: mpsc::Sender<Vec<u8>>,
    fail_connects: Arc<AtomicU32>,
    connects: Arc<AtomicU32>,
}

/// Switch-side half: observe point frames, feed responses, script faults.
pub struct MemorySwitch {
    to_point: mpsc::Sender<Inbound>,
    from_point: Mutex<mpsc::Receiver<Vec<u8>>>,
    fail_connects: Arc<AtomicU32>,
    connects: Arc<AtomicU32>,
}

impl MemoryTransport {
    /// Create a connected pair of halves.
    pub fn pair() -> (Self, MemorySwitch) {
        let (to_point_tx, to_point_rx) = mpsc::channel(QUEUE_DEPTH);
        let (from_point_tx, from_point_rx) = mpsc::channel(QUEUE_DEPTH);
        let fail_connects = Arc::new(AtomicU32::new(0));
        let connects = Arc::new(AtomicU32::new(0));

        let transport = Self {
            link: Link::default(),
            to_point: Mutex::new(to_point_rx),
            from_point: from_point_tx,
            fail_connects: fail_connects.clone(),
            connects: connects.clone(),
        };
        let switch = MemorySwitch {
            to_point: to_point_tx,
            from_point: Mutex::new(from_point_rx),
            fail_connects,
            connects,
        };
        (transport, switch)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.link.set_status(LinkStatus::Connecting);
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            self.link.set_status(LinkStatus::Closed);
            return Err(Error::connection("scripted connect failure"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.link.mark_connected(None, None);
        Ok(())
    }

    async fn close(&self) {
        self.link.mark_closed();
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut rx = self.to_point.lock().await;
        match rx.recv().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(fault)) => {
                drop(rx);
                self.link.mark_closed();
                Err(Error::connection(fault))
            }
            None => {
                drop(rx);
                self.link.mark_closed();
                Err(Error::ChannelClosed)
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.status() != LinkStatus::Connected {
            return Err(Error::NotConnected);
        }
        self.from_point
            .send(frame.to_vec())
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    fn status(&self) -> LinkStatus {
        self.link.status()
    }

    fn set_status(&self, status: LinkStatus) {
        self.link.set_status(status);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_listener(&self, listener: Arc<dyn LinkListener>) {
        self.link.set_listener(listener);
    }
}

impl MemorySwitch {
    /// Deliver a frame to the point.
    pub async fn send(&self, frame: Vec<u8>) {
        let _ = self.to_point.send(Ok(frame)).await;
    }

    /// Make the point's next pending read fail, as a broken link would.
    pub async fn inject_read_error(&self, reason: &str) {
        let _ = self.to_point.send(Err(reason.to_string())).await;
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Receive the next frame the point wrote, if any.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.from_point.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_exchange() {
        let (transport, switch) = MemoryTransport::pair();
        transport.connect().await.unwrap();

        transport.write_frame(b"hello").await.unwrap();
        assert_eq!(switch.recv().await.unwrap(), b"hello");

        switch.send(b"world".to_vec()).await;
        assert_eq!(transport.read_frame().await.unwrap(), b"world");
        assert_eq!(switch.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let (transport, switch) = MemoryTransport::pair();
        switch.fail_next_connects(2);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        transport.connect().await.unwrap();
        assert_eq!(switch.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_read_error_closes_link() {
        let (transport, switch) = MemoryTransport::pair();
        transport.connect().await.unwrap();

        switch.inject_read_error("reset by peer").await;
        assert!(transport.read_frame().await.is_err());
        assert_eq!(transport.status(), LinkStatus::Closed);
    }
}
