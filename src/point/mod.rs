//! Point orchestrator: composes the connection worker, the virtual
//! interface worker and the neighbor table, and exposes lifecycle and
//! status to the shell.
//!
//! All cross-worker wiring (queues, listeners) is established once in
//! `start` and never mutated afterwards.

pub mod conn;
pub mod iface;

pub use conn::{ConnConfig, ConnListener, ConnState, ConnWorker, Credential, Lease, LeaseRoute};
pub use iface::IfaceWorker;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PointConfig, Protocol};
use crate::device::DeviceOpener;
use crate::error::{Error, Result};
use crate::neighbor::{NeighborTable, DEFAULT_SWEEP_INTERVAL};
use crate::packet::stream::StreamCodec;
use crate::route::{PrefixRule, RouteTable};
use crate::transport::{TcpTransport, TlsTransport, Transport, UdpTransport};
use crate::{POINT_VERSION, WRITE_QUEUE_DEPTH};

/// Receives address/route changes; the shell wires these to OS-level
/// networking collaborators.
pub trait PointListener: Send + Sync {
    fn add_address(&self, addr: &str);
    fn del_address(&self, addr: &str);
    fn add_routes(&self, routes: &[PrefixRule]);
    fn del_routes(&self, routes: &[PrefixRule]);
}

/// Listener that only logs, for shells without OS-level wiring.
pub struct LoggingListener;

impl PointListener for LoggingListener {
    fn add_address(&self, addr: &str) {
        info!(addr, "address assigned");
    }
    fn del_address(&self, addr: &str) {
        info!(addr, "address removed");
    }
    fn add_routes(&self, routes: &[PrefixRule]) {
        info!(count = routes.len(), "routes added");
    }
    fn del_routes(&self, routes: &[PrefixRule]) {
        info!(count = routes.len(), "routes removed");
    }
}

/// A point: one endpoint attached to the overlay through the switch.
pub struct Point {
    cfg: PointConfig,
    uuid: String,
    neighbors: Arc<NeighborTable>,
    routes: Arc<RouteTable>,
    listener: OnceLock<Arc<dyn PointListener>>,
    conn: Mutex<Option<Arc<ConnWorker>>>,
    iface: Mutex<Option<Arc<IfaceWorker>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl Point {
    /// Build a point from configuration. The UUID is generated client-side
    /// and sent with the login credential.
    pub fn new(cfg: PointConfig) -> Self {
        Self {
            cfg,
            uuid: uuid::Uuid::new_v4().to_string(),
            neighbors: Arc::new(NeighborTable::default()),
            routes: Arc::new(RouteTable::new()),
            listener: OnceLock::new(),
            conn: Mutex::new(None),
            iface: Mutex::new(None),
            sweeper: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    /// Register the OS-wiring listener. Later calls are ignored.
    pub fn set_listener(&self, listener: Arc<dyn PointListener>) {
        let _ = self.listener.set(listener);
    }

    /// Start with collaborators built from configuration.
    pub async fn start(&self) -> Result<()> {
        let transport = self.build_transport()?;
        let opener = self.build_opener()?;
        self.start_with(transport, opener).await
    }

    /// Start with explicitly provided collaborators (tests use in-memory
    /// transports and devices here).
    pub async fn start_with(
        &self,
        transport: Arc<dyn Transport>,
        opener: DeviceOpener,
    ) -> Result<()> {
        if self.started_at.lock().unwrap().is_some() {
            return Ok(());
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let conn_cfg = ConnConfig {
            credential: Credential {
                name: self.cfg.username.clone(),
                password: self.cfg.password.clone(),
                network: self.cfg.network.clone(),
                uuid: self.uuid.clone(),
                alias: self.cfg.alias.clone(),
                version: POINT_VERSION.to_string(),
            },
            request_addr: self.cfg.request_addr,
            idle_timeout: self.cfg.idle_timeout(),
        };
        let conn = Arc::new(ConnWorker::new(transport, conn_cfg, inbound_tx));

        let iface = Arc::new(IfaceWorker::new(
            opener,
            self.neighbors.clone(),
            self.routes.clone(),
            conn.queue(),
            inbound_rx,
        )?);

        // Static address, if configured; a lease overrides it later.
        if !self.cfg.interface.address.is_empty() {
            let ip = parse_address(&self.cfg.interface.address)?;
            iface.set_ether(ip);
        }

        self.neighbors.set_listener(iface.resolver());

        let listener = self
            .listener
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(LoggingListener));
        conn.set_listener(Arc::new(Wiring {
            listener,
            iface: iface.clone(),
            routes: self.routes.clone(),
            applied: Mutex::new(None),
        }));

        conn.start();
        iface.start();
        *self.sweeper.lock().unwrap() =
            Some(self.neighbors.clone().spawn_sweeper(DEFAULT_SWEEP_INTERVAL));

        *self.conn.lock().unwrap() = Some(conn);
        *self.iface.lock().unwrap() = Some(iface);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        info!(uuid = %self.uuid, network = %self.cfg.network, "point started");
        Ok(())
    }

    /// Stop everything: graceful leave, workers down, device closed.
    /// Safe to call twice.
    pub async fn stop(&self) {
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.stop().await;
        }
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let iface = self.iface.lock().unwrap().take();
        if let Some(iface) = iface {
            iface.stop().await;
        }
        if self.started_at.lock().unwrap().take().is_some() {
            info!(uuid = %self.uuid, "point stopped");
        }
    }

    /// Client-generated identity sent at login.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Connection state, `Init` before the first start.
    pub fn state(&self) -> ConnState {
        self.conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|conn| conn.state())
            .unwrap_or(ConnState::Init)
    }

    /// Leased or configured interface address, as `a.b.c.d/len` if leased.
    pub fn address(&self) -> Option<String> {
        let conn = self.conn.lock().unwrap().clone();
        if let Some(lease) = conn.as_ref().and_then(|c| c.lease()) {
            if let Ok(cidr) = lease.address_cidr() {
                return Some(cidr);
            }
        }
        self.iface
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|iface| iface.address())
            .map(|ip| ip.to_string())
    }

    /// OS name of the virtual device.
    pub fn interface_name(&self) -> Option<String> {
        self.iface
            .lock()
            .unwrap()
            .as_ref()
            .map(|iface| iface.name())
    }

    /// Time since start, zero when stopped.
    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        let addr = self.cfg.switch_addr();
        let codec = StreamCodec::new(
            crate::packet::stream::DEFAULT_MIN_FRAME,
            self.cfg.interface.mtu,
        );
        let timeout = Duration::from_secs(10);
        Ok(match self.cfg.protocol {
            Protocol::Tcp => Arc::new(TcpTransport::new(addr, timeout, codec)),
            Protocol::Tls => Arc::new(TlsTransport::new(
                addr,
                self.cfg.switch_host().to_string(),
                self.cfg.crypt.skip_verify,
                timeout,
                codec,
            )),
            Protocol::Udp => Arc::new(UdpTransport::new(addr, codec)),
        })
    }

    #[cfg(target_os = "linux")]
    fn build_opener(&self) -> Result<DeviceOpener> {
        use crate::config::Provider;
        use crate::device::{DeviceMode, TunTapDevice};

        let name = self.cfg.interface.name.clone();
        let mode = match self.cfg.interface.provider {
            Provider::Tap => DeviceMode::Tap,
            Provider::Tun => DeviceMode::Tun,
        };
        let mtu = self.cfg.interface.mtu;
        Ok(Box::new(move || {
            let device = TunTapDevice::open(&name, mode, mtu)
                .map_err(|e| Error::device(format!("open {name:?}: {e}")))?;
            Ok(Arc::new(device) as Arc<dyn crate::device::TapDevice>)
        }))
    }

    #[cfg(not(target_os = "linux"))]
    fn build_opener(&self) -> Result<DeviceOpener> {
        Err(Error::device("virtual devices are only supported on linux"))
    }
}

/// Bridges connection outcomes to the interface worker, the route table
/// and the shell listener. Set once at start.
struct Wiring {
    listener: Arc<dyn PointListener>,
    iface: Arc<IfaceWorker>,
    routes: Arc<RouteTable>,
    applied: Mutex<Option<Lease>>,
}

impl ConnListener for Wiring {
    fn on_authenticated(&self) {
        debug!("authenticated with switch");
    }

    fn on_unauthenticated(&self, reason: &str) {
        warn!(reason, "unauthenticated, tearing down lease");
        let applied = self.applied.lock().unwrap().take();
        if let Some(lease) = applied {
            if let Ok(cidr) = lease.address_cidr() {
                self.listener.del_address(&cidr);
            }
            if let Ok(rules) = lease.prefix_rules() {
                self.routes.del_rules(&rules);
                self.listener.del_routes(&rules);
            }
        }
    }

    fn on_lease(&self, lease: &Lease) {
        match lease.address.parse::<Ipv4Addr>() {
            Ok(ip) => self.iface.set_ether(ip),
            Err(_) => {
                warn!(address = %lease.address, "lease with bad address");
                return;
            }
        }
        match lease.address_cidr() {
            Ok(cidr) => self.listener.add_address(&cidr),
            Err(e) => warn!(error = %e, "lease netmask rejected"),
        }
        match lease.prefix_rules() {
            Ok(rules) => {
                self.routes.add_rules(&rules);
                self.listener.add_routes(&rules);
            }
            Err(e) => warn!(error = %e, "lease routes rejected"),
        }
        *self.applied.lock().unwrap() = Some(lease.clone());
    }
}

/// Parse `a.b.c.d` or `a.b.c.d/len` into the bare address.
fn parse_address(s: &str) -> Result<Ipv4Addr> {
    let bare = s.split('/').next().unwrap_or(s);
    bare.parse()
        .map_err(|_| Error::config(format!("bad interface address {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("192.168.1.4").unwrap(),
            Ipv4Addr::new(192, 168, 1, 4)
        );
        assert_eq!(
            parse_address("192.168.1.4/24").unwrap(),
            Ipv4Addr::new(192, 168, 1, 4)
        );
        assert!(parse_address("bogus").is_err());
    }

    #[test]
    fn test_point_idle_accessors() {
        let cfg = PointConfig {
            connection: "switch.example.com".into(),
            protocol: Protocol::Tcp,
            username: "alice".into(),
            password: "secret".into(),
            network: "private".into(),
            alias: String::new(),
            request_addr: true,
            interface: Default::default(),
            timeout: 30,
            crypt: Default::default(),
        };
        let point = Point::new(cfg);

        assert_eq!(point.state(), ConnState::Init);
        assert!(point.address().is_none());
        assert!(point.interface_name().is_none());
        assert_eq!(point.uptime(), Duration::ZERO);
        assert_eq!(point.uuid().len(), 36);
    }
}
