//! Point-side client library for the overlan virtual-LAN overlay.
//!
//! A central switch bridges Ethernet frames between remote points over
//! TCP/TLS/UDP transports. This library implements the point side: the wire
//! frame codec, the resilient connection state machine (login, keepalive,
//! bounded-backoff reconnect), and the virtual-interface worker that turns
//! raw link-layer traffic into frames and back, including ARP proxying and
//! neighbor resolution for TUN-mode links.

pub mod config;
pub mod device;
pub mod error;
pub mod neighbor;
pub mod packet;
pub mod point;
pub mod route;
pub mod transport;

pub use config::PointConfig;
pub use error::{Error, Result};
pub use point::{Point, PointListener};

use std::time::Duration;

/// Client version reported in the login credential.
pub const POINT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "point.json";

/// Capacity of each worker write queue. A full queue blocks the producer;
/// frames are never dropped, duplicated or reordered to make room.
pub const WRITE_QUEUE_DEPTH: usize = 1024;

/// Cadence of the connection worker's event-loop tick, which drives both
/// keepalive checks and due job timers.
pub const EVENT_TICK: Duration = Duration::from_secs(2);

/// Keepalive ping interval while authenticated.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
