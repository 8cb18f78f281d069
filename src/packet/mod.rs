//! Wire formats: point-to-switch frames, stream framing, Ethernet and ARP.

pub mod arp;
pub mod ethernet;
pub mod frame;
pub mod stream;

pub use arp::{ArpOperation, ArpPacket};
pub use ethernet::{format_mac, random_mac, EtherType, BROADCAST_MAC, ZERO_MAC};
pub use frame::{action, Frame, SEP_REQUEST, SEP_RESPONSE};
pub use stream::{StreamCodec, DEFAULT_MAX_FRAME, DEFAULT_MIN_FRAME, STREAM_MAGIC};
