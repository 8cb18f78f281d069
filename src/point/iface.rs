//! Virtual-interface worker: moves traffic between the TAP/TUN device and
//! the connection worker.
//!
//! TAP devices already speak Ethernet, so frames pass through unchanged. In
//! TUN mode the worker owns the link layer itself: it resolves next-hops
//! through the neighbor table, synthesizes Ethernet headers on the way out,
//! answers ARP aimed at its synthetic address, and strips headers on the
//! way in.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{DeviceOpener, TapDevice};
use crate::error::Result;
use crate::neighbor::{NeighborEntry, NeighborListener, NeighborTable};
use crate::packet::arp::{ArpOperation, ArpPacket};
use crate::packet::ethernet::{ipv4_destination, random_mac, unwrap_ipv4, wrap_ipv4, EtherType};
use crate::packet::frame::Frame;
use crate::route::RouteTable;

/// Sleep before a non-error re-open; also rate-limits error re-opens.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

struct IfaceShared {
    device: Mutex<Arc<dyn TapDevice>>,
    opener: DeviceOpener,
    neighbors: Arc<NeighborTable>,
    routes: Arc<RouteTable>,
    /// Synthetic hardware address used in ARP replies and outbound headers.
    mac: [u8; 6],
    /// Synthetic IP, set from configuration or the switch lease.
    address: Mutex<Option<Ipv4Addr>>,
    /// Forces a device re-open at the top of the next read iteration.
    reopen: AtomicBool,
    running: AtomicBool,
    is_tun: bool,
    out_tx: mpsc::Sender<Frame>,
}

impl IfaceShared {
    fn current_device(&self) -> Arc<dyn TapDevice> {
        self.device.lock().unwrap().clone()
    }

    fn address(&self) -> Option<Ipv4Addr> {
        *self.address.lock().unwrap()
    }

    fn send_arp_request(&self, target: Ipv4Addr) {
        let Some(our_ip) = self.address() else {
            return;
        };
        let wire = ArpPacket::request(self.mac, our_ip, target).to_vec();
        match Frame::decode(wire) {
            Ok(frame) => {
                if self.out_tx.try_send(frame).is_err() {
                    debug!(%target, "resolve request dropped, queue full");
                }
            }
            Err(e) => debug!(error = %e, "arp request build failed"),
        }
    }

    /// Device bytes going towards the switch.
    fn process_outbound(&self, packet: &[u8]) {
        if !self.is_tun {
            match Frame::decode(packet.to_vec()) {
                Ok(frame) => {
                    // Producer blocks when the queue is full; frames are
                    // never reordered to make room.
                    if self.out_tx.blocking_send(frame).is_err() {
                        debug!("outbound queue closed");
                    }
                }
                Err(e) => debug!(error = %e, "device frame rejected"),
            }
            return;
        }

        // TUN: bare IP in, Ethernet out.
        let Some(dst) = ipv4_destination(packet) else {
            return;
        };
        if self.address().is_none() {
            return;
        }

        let nexthop = self.routes.find_next(dst);
        match self.neighbors.get_by_addr(nexthop) {
            Some(entry) => {
                let wire = wrap_ipv4(packet, &entry.hwaddr, &self.mac);
                match Frame::decode(wire) {
                    Ok(frame) => {
                        if self.out_tx.blocking_send(frame).is_err() {
                            debug!("outbound queue closed");
                        }
                    }
                    Err(e) => debug!(error = %e, "ethernet synthesis failed"),
                }
            }
            None => {
                // No binding yet: drop this packet and ask for the
                // next-hop; the sender retries once resolution completes.
                debug!(%dst, %nexthop, "no neighbor, resolving");
                self.send_arp_request(nexthop);
            }
        }
    }

    /// Frames arriving from the switch for the device.
    async fn process_inbound(&self, frame: Frame) {
        let device = self.current_device();

        if !self.is_tun {
            if let Err(e) = device.write(frame.as_bytes()) {
                warn!(error = %e, "device write failed");
                self.reopen.store(true, Ordering::SeqCst);
            }
            return;
        }

        let bytes = frame.as_bytes();
        match EtherType::from_frame(bytes) {
            Some(EtherType::Arp) => {
                let Some(arp) = ArpPacket::parse(bytes) else {
                    return;
                };
                // Any observed ARP refreshes the sender's binding.
                if !arp.sender_ip.is_unspecified() {
                    self.neighbors.add(arp.sender_mac, arp.sender_ip);
                }
                if arp.operation == ArpOperation::Request {
                    if let Some(our_ip) = self.address() {
                        if arp.target_ip == our_ip {
                            // Proxy: answer locally, never forward the
                            // request into the device.
                            let reply = ArpPacket::reply(
                                self.mac,
                                our_ip,
                                arp.sender_mac,
                                arp.sender_ip,
                            )
                            .to_vec();
                            if let Ok(frame) = Frame::decode(reply) {
                                let _ = self.out_tx.send(frame).await;
                            }
                        }
                    }
                }
            }
            Some(EtherType::Ipv4) => {
                if let Some(ip_packet) = unwrap_ipv4(bytes) {
                    if let Err(e) = device.write(ip_packet) {
                        warn!(error = %e, "device write failed");
                        self.reopen.store(true, Ordering::SeqCst);
                    }
                }
            }
            _ => {
                // TUN carries IPv4 only.
            }
        }
    }

    /// Blocking read loop; runs on its own thread until stopped.
    fn read_loop(&self) {
        let mut buf = vec![0u8; self.current_device().mtu() + 64];
        while self.running.load(Ordering::SeqCst) {
            if self.reopen.swap(false, Ordering::SeqCst) {
                std::thread::sleep(REOPEN_DELAY);
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.reopen_device();
            }

            let device = self.current_device();
            match device.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.process_outbound(&buf[..n]),
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "device read failed");
                    self.reopen.store(true, Ordering::SeqCst);
                }
            }
        }
        self.current_device().close();
        debug!("device read loop ended");
    }

    fn reopen_device(&self) {
        let old = self.current_device();
        old.close();
        match (self.opener)() {
            Ok(device) => {
                info!(name = device.name(), "device reopened");
                *self.device.lock().unwrap() = device;
            }
            Err(e) => {
                // Retry on the next iteration, after the forced sleep.
                warn!(error = %e, "device reopen failed");
                self.reopen.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl NeighborListener for IfaceShared {
    fn on_interval(&self, entry: &NeighborEntry) {
        self.send_arp_request(entry.ipaddr);
    }

    fn on_expire(&self, entry: &NeighborEntry) {
        self.send_arp_request(entry.ipaddr);
    }
}

/// Public handle to the virtual-interface worker.
pub struct IfaceWorker {
    shared: Arc<IfaceShared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
}

impl IfaceWorker {
    /// Open the initial device and build the worker. `out_tx` feeds the
    /// connection worker; `inbound_rx` drains frames it received.
    pub fn new(
        opener: DeviceOpener,
        neighbors: Arc<NeighborTable>,
        routes: Arc<RouteTable>,
        out_tx: mpsc::Sender<Frame>,
        inbound_rx: mpsc::Receiver<Frame>,
    ) -> Result<Self> {
        let device = opener()?;
        let is_tun = device.is_tun();
        let shared = Arc::new(IfaceShared {
            device: Mutex::new(device),
            opener,
            neighbors,
            routes,
            mac: random_mac(),
            address: Mutex::new(None),
            reopen: AtomicBool::new(false),
            running: AtomicBool::new(false),
            is_tun,
            out_tx,
        });
        Ok(Self {
            shared,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            read_task: Mutex::new(None),
            write_task: Mutex::new(None),
        })
    }

    /// OS name of the current device.
    pub fn name(&self) -> String {
        self.shared.current_device().name().to_string()
    }

    /// True when driving a TUN (IP-only) device.
    pub fn is_tun(&self) -> bool {
        self.shared.is_tun
    }

    /// Synthetic hardware address.
    pub fn mac(&self) -> [u8; 6] {
        self.shared.mac
    }

    /// Current synthetic IP, if configured.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.shared.address()
    }

    /// Listener that re-triggers ARP resolution on neighbor sweeps.
    pub fn resolver(&self) -> Arc<dyn NeighborListener> {
        self.shared.clone()
    }

    /// Change the synthetic address. Cached neighbors are keyed against
    /// topology that may have shifted, so the table is cleared and the
    /// device re-opened.
    pub fn set_ether(&self, address: Ipv4Addr) {
        info!(%address, "interface address set");
        *self.shared.address.lock().unwrap() = Some(address);
        self.shared.neighbors.clear();
        // Only a live device holds state worth invalidating.
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.reopen.store(true, Ordering::SeqCst);
        }
    }

    /// Spawn the device read thread and the inbound write loop.
    pub fn start(&self) {
        let Some(mut inbound_rx) = self.inbound_rx.lock().unwrap().take() else {
            return;
        };
        self.shared.running.store(true, Ordering::SeqCst);

        let reader = self.shared.clone();
        *self.read_task.lock().unwrap() = Some(tokio::task::spawn_blocking(move || {
            reader.read_loop();
        }));

        let writer = self.shared.clone();
        *self.write_task.lock().unwrap() = Some(tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                if !writer.running.load(Ordering::SeqCst) {
                    break;
                }
                writer.process_inbound(frame).await;
            }
            debug!("device write loop ended");
        }));
    }

    /// Stop both loops and close the device. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.current_device().close();

        let write_task = self.write_task.lock().unwrap().take();
        if let Some(task) = write_task {
            task.abort();
        }
        let read_task = self.read_task.lock().unwrap().take();
        if let Some(task) = read_task {
            let _ = task.await;
        }
    }
}
