//! Configuration for the point client.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::stream::DEFAULT_MAX_FRAME;

/// Default switch port.
pub const DEFAULT_PORT: u16 = 10002;

/// Point client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    /// Switch address as `host` or `host:port`.
    pub connection: String,

    /// Transport protocol towards the switch.
    #[serde(default)]
    pub protocol: Protocol,

    /// Username for authentication.
    pub username: String,

    /// Password for authentication.
    pub password: String,

    /// Network tag this point attaches to.
    pub network: String,

    /// Free-form alias shown on the switch (default: hostname-style empty).
    #[serde(default)]
    pub alias: String,

    /// Ask the switch for an address lease after login.
    #[serde(default = "default_true")]
    pub request_addr: bool,

    /// Virtual interface settings.
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Seconds without any received frame before a write forces a reconnect.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// TLS settings.
    #[serde(default)]
    pub crypt: CryptConfig,
}

/// Transport protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Tls,
    Udp,
}

/// Virtual interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Device name; empty lets the kernel choose.
    #[serde(default)]
    pub name: String,

    /// `tap` for full Ethernet frames, `tun` for bare IP packets.
    #[serde(default)]
    pub provider: Provider,

    /// Static address as `a.b.c.d/len`; empty waits for a switch lease.
    #[serde(default)]
    pub address: String,

    /// Device MTU, also the upper frame-size bound on the wire.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// Virtual device flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Tun,
    Tap,
}

/// TLS settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptConfig {
    /// Accept self-signed switch certificates.
    #[serde(default)]
    pub skip_verify: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: Provider::default(),
            address: String::new(),
            mtu: default_mtu(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_mtu() -> usize {
    DEFAULT_MAX_FRAME
}

impl PointConfig {
    /// Load and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!("read {}: {e}", path.as_ref().display()))
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants not expressible in the schema.
    pub fn validate(&self) -> Result<()> {
        if self.connection.is_empty() {
            return Err(Error::config("connection must not be empty"));
        }
        if self.username.is_empty() {
            return Err(Error::config("username must not be empty"));
        }
        if self.network.is_empty() {
            return Err(Error::config("network must not be empty"));
        }
        if self.interface.mtu < 576 {
            return Err(Error::config(format!(
                "mtu {} below minimum 576",
                self.interface.mtu
            )));
        }
        Ok(())
    }

    /// Switch address with the default port applied when missing.
    pub fn switch_addr(&self) -> String {
        if self.connection.contains(':') {
            self.connection.clone()
        } else {
            format!("{}:{}", self.connection, DEFAULT_PORT)
        }
    }

    /// Hostname part of the switch address, for TLS server names.
    pub fn switch_host(&self) -> &str {
        self.connection
            .split(':')
            .next()
            .unwrap_or(&self.connection)
    }

    /// Idle timeout before a write forces a reconnect.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
