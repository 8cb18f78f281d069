//! In-memory virtual device for tests and examples.
//!
//! The handle half plays the OS network stack: it injects packets the
//! worker will read and observes packets the worker wrote. Read errors can
//! be scripted to exercise the device re-open path.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{DeviceMode, TapDevice};

const READ_WAIT: Duration = Duration::from_millis(50);

enum ReadItem {
    Packet(Vec<u8>),
    Error(String),
}

struct Shared {
    inbound: Mutex<VecDeque<ReadItem>>,
    available: Condvar,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

/// Device half handed to the interface worker.
pub struct MemoryDevice {
    name: String,
    mode: DeviceMode,
    mtu: usize,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

/// Test half: inject reads, observe writes, script faults.
#[derive(Clone)]
pub struct MemoryDeviceHandle {
    shared: Arc<Shared>,
    written: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryDevice {
    /// Create a device plus its controlling handle.
    pub fn pair(name: &str, mode: DeviceMode, mtu: usize) -> (Self, MemoryDeviceHandle) {
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            written: written_tx,
        });
        let device = Self {
            name: name.to_string(),
            mode,
            mtu,
            shared: shared.clone(),
            closed: AtomicBool::new(false),
        };
        let handle = MemoryDeviceHandle {
            shared,
            written: Arc::new(tokio::sync::Mutex::new(written_rx)),
        };
        (device, handle)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"))
        } else {
            Ok(())
        }
    }
}

impl TapDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_tun(&self) -> bool {
        self.mode == DeviceMode::Tun
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut inbound = self.shared.inbound.lock().unwrap();
        if inbound.is_empty() {
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(inbound, READ_WAIT)
                .unwrap();
            inbound = guard;
        }
        match inbound.pop_front() {
            None => Ok(0),
            Some(ReadItem::Packet(packet)) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            Some(ReadItem::Error(fault)) => Err(io::Error::new(io::ErrorKind::Other, fault)),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.shared
            .written
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "handle dropped"))?;
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl MemoryDeviceHandle {
    /// Attach a fresh device half to this handle (used by re-open paths).
    pub fn attach(&self, name: &str, mode: DeviceMode, mtu: usize) -> MemoryDevice {
        MemoryDevice {
            name: name.to_string(),
            mode,
            mtu,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a packet for the worker's next device read.
    pub fn inject(&self, packet: Vec<u8>) {
        let mut inbound = self.shared.inbound.lock().unwrap();
        inbound.push_back(ReadItem::Packet(packet));
        self.shared.available.notify_one();
    }

    /// Make the worker's next device read fail.
    pub fn inject_error(&self, reason: &str) {
        let mut inbound = self.shared.inbound.lock().unwrap();
        inbound.push_back(ReadItem::Error(reason.to_string()));
        self.shared.available.notify_one();
    }

    /// Next packet the worker wrote to the device, if any.
    pub async fn recv_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }
}
