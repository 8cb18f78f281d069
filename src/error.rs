//! Error types for the overlan point client.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the point client.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violation local to one connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame shorter than the minimum header
    #[error("Frame too short: need {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    /// Stream header carried an unknown magic constant
    #[error("Bad stream magic: {0:02X?}")]
    BadMagic([u8; 2]),

    /// Stream header length outside the configured bounds
    #[error("Frame length {len} outside {min}..={max}")]
    LengthOutOfRange { len: usize, min: usize, max: usize },

    /// Switch rejected the login
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Virtual device error
    #[error("Device error: {0}")]
    Device(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Internal queue closed
    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,

    /// JSON body could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Errors that close the enclosing connection rather than the process.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::Io(_)
                | Self::Protocol(_)
                | Self::BadMagic(_)
                | Self::LengthOutOfRange { .. }
                | Self::Timeout
        )
    }
}
