//! Wire frames exchanged between a point and the switch.
//!
//! Two kinds of frame travel over one connection: real Ethernet frames, and
//! control frames whose destination address is all-zero. A control payload is
//! `ACTION SEP BODY` where the four-character action is followed by `=` for a
//! request or `:` for a response, one space, and an opaque body.

use std::fmt;
use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Length of the zeroed destination-address sentinel.
pub const ADDR_LEN: usize = 6;

/// Length of a control action code.
pub const ACTION_LEN: usize = 4;

/// Smallest valid control frame: sentinel + action + separator + space.
pub const MIN_CONTROL_SIZE: usize = ADDR_LEN + ACTION_LEN + 2;

/// Smallest valid Ethernet frame: two addresses + EtherType.
pub const MIN_ETHERNET_SIZE: usize = 14;

/// Separator marking an outbound request.
pub const SEP_REQUEST: u8 = b'=';

/// Separator marking an inbound response.
pub const SEP_RESPONSE: u8 = b':';

/// Control action codes understood by the connection worker.
pub mod action {
    /// Login with credentials.
    pub const LOGIN: &str = "logi";
    /// Network lease request/response.
    pub const IPADDR: &str = "ipad";
    /// Keepalive probe.
    pub const PING: &str = "ping";
    /// Keepalive answer.
    pub const PONG: &str = "pong";
    /// Graceful departure notification.
    pub const LEFT: &str = "left";
    /// Switch-initiated request to log in again.
    pub const SIGNIN: &str = "sign";
}

/// Decoded view of a control frame, cached inside [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ControlView {
    sep: u8,
}

/// A single wire frame with exclusive ownership of its bytes.
///
/// The control view is decoded at most once and cached, so repeated calls to
/// [`Frame::action`] and [`Frame::body`] never re-parse.
pub struct Frame {
    data: Vec<u8>,
    view: OnceLock<Option<ControlView>>,
}

impl Frame {
    /// Validate raw bytes received from a transport and take ownership.
    ///
    /// Frames shorter than the minimum header for their kind are rejected
    /// with a size error, never a panic.
    pub fn decode(data: Vec<u8>) -> Result<Self> {
        if data.len() >= ADDR_LEN && data[..ADDR_LEN].iter().all(|b| *b == 0) {
            if data.len() < MIN_CONTROL_SIZE {
                return Err(Error::FrameTooShort {
                    expected: MIN_CONTROL_SIZE,
                    actual: data.len(),
                });
            }
        } else if data.len() < MIN_ETHERNET_SIZE {
            return Err(Error::FrameTooShort {
                expected: MIN_ETHERNET_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            view: OnceLock::new(),
        })
    }

    /// Wrap a full Ethernet frame without touching its bytes.
    pub fn ethernet(data: Vec<u8>) -> Result<Self> {
        Self::decode(data)
    }

    /// Encode a control frame: zeroed destination, action, separator, body.
    pub fn control(action: &str, sep: u8, body: &[u8]) -> Result<Self> {
        if action.len() != ACTION_LEN {
            return Err(Error::protocol(format!(
                "control action must be {ACTION_LEN} chars: {action:?}"
            )));
        }
        if sep != SEP_REQUEST && sep != SEP_RESPONSE {
            return Err(Error::protocol(format!("bad separator: {sep:#04x}")));
        }
        let mut buf = BytesMut::with_capacity(MIN_CONTROL_SIZE + body.len());
        buf.put_bytes(0, ADDR_LEN);
        buf.put_slice(action.as_bytes());
        buf.put_u8(sep);
        buf.put_u8(b' ');
        buf.put_slice(body);
        Ok(Self {
            data: buf.to_vec(),
            view: OnceLock::new(),
        })
    }

    /// Shorthand for an outbound request frame.
    pub fn request(action: &str, body: &[u8]) -> Result<Self> {
        Self::control(action, SEP_REQUEST, body)
    }

    /// Shorthand for a response frame.
    pub fn response(action: &str, body: &[u8]) -> Result<Self> {
        Self::control(action, SEP_RESPONSE, body)
    }

    /// True iff the first six bytes are all zero.
    pub fn is_control(&self) -> bool {
        self.data.len() >= ADDR_LEN && self.data[..ADDR_LEN].iter().all(|b| *b == 0)
    }

    fn view(&self) -> Option<&ControlView> {
        self.view
            .get_or_init(|| {
                if !self.is_control() || self.data.len() < MIN_CONTROL_SIZE {
                    return None;
                }
                Some(ControlView {
                    sep: self.data[ADDR_LEN + ACTION_LEN],
                })
            })
            .as_ref()
    }

    /// Action code of a control frame.
    pub fn action(&self) -> Option<&str> {
        self.view()?;
        std::str::from_utf8(&self.data[ADDR_LEN..ADDR_LEN + ACTION_LEN]).ok()
    }

    /// True for a control frame carrying the request separator.
    pub fn is_request(&self) -> bool {
        self.view().map(|v| v.sep == SEP_REQUEST).unwrap_or(false)
    }

    /// True for a control frame carrying the response separator.
    pub fn is_response(&self) -> bool {
        self.view().map(|v| v.sep == SEP_RESPONSE).unwrap_or(false)
    }

    /// Opaque body of a control frame.
    pub fn body(&self) -> &[u8] {
        if self.view().is_some() {
            &self.data[MIN_CONTROL_SIZE..]
        } else {
            &[]
        }
    }

    /// Raw frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the frame and return its bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Occupied length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer is empty (never for a validated frame).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(action) = self.action() {
            write!(
                f,
                "Frame(control {}{} {} bytes)",
                action,
                if self.is_request() { '=' } else { ':' },
                self.body().len()
            )
        } else {
            write!(f, "Frame(ethernet {} bytes)", self.data.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let frame = Frame::request(action::LOGIN, b"{\"name\":\"alice\"}").unwrap();
        assert!(frame.is_control());
        assert!(frame.is_request());
        assert!(!frame.is_response());
        assert_eq!(frame.action(), Some("logi"));
        assert_eq!(frame.body(), b"{\"name\":\"alice\"}");

        let decoded = Frame::decode(frame.into_vec()).unwrap();
        assert_eq!(decoded.action(), Some("logi"));
        assert_eq!(decoded.body(), b"{\"name\":\"alice\"}");
    }

    #[test]
    fn test_response_separator() {
        let frame = Frame::response(action::LOGIN, b"okay").unwrap();
        assert!(frame.is_response());
        assert_eq!(frame.as_bytes()[10], SEP_RESPONSE);
        assert_eq!(frame.as_bytes()[11], b' ');
    }

    #[test]
    fn test_ethernet_passthrough() {
        let mut data = vec![0u8; 60];
        data[0] = 0xFF; // non-zero destination
        let frame = Frame::ethernet(data.clone()).unwrap();
        assert!(!frame.is_control());
        assert_eq!(frame.action(), None);
        assert_eq!(frame.as_bytes(), data.as_slice());
    }

    #[test]
    fn test_control_discrimination_random_destinations() {
        // A frame is control iff the first six bytes are all zero.
        let mut data = vec![0u8; 64];
        for i in 0..ADDR_LEN {
            let mut tweaked = data.clone();
            tweaked[i] = 0x01;
            let frame = Frame::decode(tweaked).unwrap();
            assert!(!frame.is_control(), "byte {i} set must not be control");
        }
        data[6..12].copy_from_slice(b"ping= ");
        let frame = Frame::decode(data).unwrap();
        assert!(frame.is_control());
    }

    #[test]
    fn test_short_control_rejected() {
        let err = Frame::decode(vec![0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::FrameTooShort { .. }));
    }

    #[test]
    fn test_short_ethernet_rejected() {
        let err = Frame::decode(vec![0xFFu8; 10]).unwrap_err();
        assert!(matches!(err, Error::FrameTooShort { .. }));
    }

    #[test]
    fn test_bad_action_length() {
        assert!(Frame::request("login", b"").is_err());
        assert!(Frame::request("lo", b"").is_err());
    }

    #[test]
    fn test_decode_idempotent() {
        let frame = Frame::request(action::PING, b"{}").unwrap();
        assert_eq!(frame.action(), Some("ping"));
        assert_eq!(frame.action(), Some("ping"));
        assert_eq!(frame.body(), b"{}");
    }
}
