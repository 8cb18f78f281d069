//! Ethernet frame helpers for the virtual-interface worker.
//!
//! TUN devices hand us bare IP packets, so the worker synthesizes and strips
//! Ethernet headers itself. These helpers avoid allocations where a caller
//! already owns a buffer.

use std::net::Ipv4Addr;

use rand::RngCore;

/// Ethernet frame types (EtherType).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    /// IPv4
    Ipv4 = 0x0800,
    /// ARP
    Arp = 0x0806,
    /// IPv6
    Ipv6 = 0x86DD,
}

impl EtherType {
    /// Parse EtherType from a 16-bit value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x86DD => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Extract EtherType from an Ethernet frame.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        Self::from_u16(u16::from_be_bytes([frame[12], frame[13]]))
    }
}

/// Ethernet header size.
pub const HEADER_SIZE: usize = 14;

/// Broadcast MAC address.
pub const BROADCAST_MAC: [u8; 6] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Zero MAC address.
pub const ZERO_MAC: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Format a MAC address as a string.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Generate a random locally-administered unicast MAC address.
///
/// TUN devices have no hardware address of their own, so the worker mints
/// one for ARP proxying and header synthesis.
pub fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] = (mac[0] | 0x02) & 0xFE;
    mac
}

/// Prepend an Ethernet header to an IPv4 packet.
pub fn wrap_ipv4(ip_packet: &[u8], dst_mac: &[u8; 6], src_mac: &[u8; 6]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + ip_packet.len());
    frame.extend_from_slice(dst_mac);
    frame.extend_from_slice(src_mac);
    frame.extend_from_slice(&(EtherType::Ipv4 as u16).to_be_bytes());
    frame.extend_from_slice(ip_packet);
    frame
}

/// Strip the Ethernet header from an IPv4 frame, if it is one.
pub fn unwrap_ipv4(frame: &[u8]) -> Option<&[u8]> {
    if EtherType::from_frame(frame) == Some(EtherType::Ipv4) && frame.len() > HEADER_SIZE {
        Some(&frame[HEADER_SIZE..])
    } else {
        None
    }
}

/// Destination address of a bare IPv4 packet.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}
