//! ARP parsing and construction for neighbor resolution.
//!
//! The virtual-interface worker answers ARP requests aimed at its synthetic
//! address (proxy), learns neighbor bindings from replies, and emits requests
//! of its own when a TUN destination has no known link-layer address.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use super::ethernet::{EtherType, BROADCAST_MAC, HEADER_SIZE, ZERO_MAC};

/// Minimum Ethernet + ARP frame size.
pub const MIN_ARP_FRAME: usize = HEADER_SIZE + 28;

/// ARP operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOperation {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            _ => Err(()),
        }
    }
}

/// A parsed ARP packet (without its Ethernet header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse an Ethernet frame carrying IPv4-over-Ethernet ARP.
    ///
    /// Truncated or non-ARP frames return `None`; the caller treats that as
    /// "not for us", never as a fatal error.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < MIN_ARP_FRAME || EtherType::from_frame(frame) != Some(EtherType::Arp) {
            return None;
        }

        let arp = &frame[HEADER_SIZE..];

        // Hardware type Ethernet, protocol type IPv4, 6/4 address lengths.
        if u16::from_be_bytes([arp[0], arp[1]]) != 1 {
            return None;
        }
        if u16::from_be_bytes([arp[2], arp[3]]) != EtherType::Ipv4 as u16 {
            return None;
        }
        if arp[4] != 6 || arp[5] != 4 {
            return None;
        }

        let operation = ArpOperation::try_from(u16::from_be_bytes([arp[6], arp[7]])).ok()?;

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&arp[8..14]);
        let sender_ip = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);

        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&arp[18..24]);
        let target_ip = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);

        Some(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Build a broadcast ARP request asking who has `target_ip`.
    pub fn request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Bytes {
        build(
            ArpOperation::Request,
            sender_mac,
            sender_ip,
            ZERO_MAC,
            target_ip,
        )
    }

    /// Build a unicast ARP reply answering `target_*` with our binding.
    pub fn reply(
        sender_mac: [u8; 6],
        sender_ip: Ipv4Addr,
        target_mac: [u8; 6],
        target_ip: Ipv4Addr,
    ) -> Bytes {
        build(
            ArpOperation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        )
    }
}

fn build(
    operation: ArpOperation,
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Bytes {
    let mut packet = BytesMut::with_capacity(60);

    // Ethernet header: requests go to broadcast, replies to the asker.
    if operation == ArpOperation::Request {
        packet.put_slice(&BROADCAST_MAC);
    } else {
        packet.put_slice(&target_mac);
    }
    packet.put_slice(&sender_mac);
    packet.put_u16(EtherType::Arp as u16);

    // ARP header
    packet.put_u16(0x0001); // Hardware type: Ethernet
    packet.put_u16(EtherType::Ipv4 as u16);
    packet.put_u8(6); // Hardware address length
    packet.put_u8(4); // Protocol address length
    packet.put_u16(operation as u16);

    packet.put_slice(&sender_mac);
    packet.put_slice(&sender_ip.octets());
    packet.put_slice(&target_mac);
    packet.put_slice(&target_ip.octets());

    // Pad to minimum Ethernet frame size.
    while packet.len() < 60 {
        packet.put_u8(0x00);
    }

    packet.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const MAC_B: [u8; 6] = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];

    #[test]
    fn test_request_parse_roundtrip() {
        let ip_a = Ipv4Addr::new(10, 1, 0, 5);
        let ip_b = Ipv4Addr::new(10, 1, 0, 9);

        let wire = ArpPacket::request(MAC_A, ip_a, ip_b);
        assert_eq!(&wire[..6], &BROADCAST_MAC);
        assert_eq!(wire.len(), 60);

        let parsed = ArpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.operation, ArpOperation::Request);
        assert_eq!(parsed.sender_mac, MAC_A);
        assert_eq!(parsed.sender_ip, ip_a);
        assert_eq!(parsed.target_mac, ZERO_MAC);
        assert_eq!(parsed.target_ip, ip_b);
    }

    #[test]
    fn test_reply_parse_roundtrip() {
        let ip_a = Ipv4Addr::new(10, 1, 0, 5);
        let ip_b = Ipv4Addr::new(10, 1, 0, 9);

        let wire = ArpPacket::reply(MAC_B, ip_b, MAC_A, ip_a);
        assert_eq!(&wire[..6], &MAC_A, "replies are unicast to the asker");

        let parsed = ArpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.operation, ArpOperation::Reply);
        assert_eq!(parsed.sender_mac, MAC_B);
        assert_eq!(parsed.sender_ip, ip_b);
        assert_eq!(parsed.target_mac, MAC_A);
        assert_eq!(parsed.target_ip, ip_a);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let wire = ArpPacket::request(MAC_A, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        assert!(ArpPacket::parse(&wire[..MIN_ARP_FRAME - 1]).is_none());
    }

    #[test]
    fn test_parse_rejects_non_arp() {
        let mut frame = vec![0u8; 60];
        frame[0] = 0xFF;
        frame[12] = 0x08;
        frame[13] = 0x00; // IPv4, not ARP
        assert!(ArpPacket::parse(&frame).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_lengths() {
        let mut wire =
            ArpPacket::request(MAC_A, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
                .to_vec();
        wire[HEADER_SIZE + 4] = 8; // hardware address length
        assert!(ArpPacket::parse(&wire).is_none());
    }
}
