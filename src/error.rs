use std::io;

/// Errors surfaced synchronously by [`Client::connect`](crate::Client::connect).
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("No NatNet server answered discovery within {0} ms")]
    NoServerFound(u64),

    #[error("Local address already in use: {0}")]
    AddressInUse(io::Error),

    #[error("Server did not answer the handshake within {0} ms")]
    HandshakeTimeout(u64),

    #[error("Unsupported NatNet protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to spawn receiver thread: {0}")]
    Spawn(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    /// Numeric status code: 1 discovery failure, 2 handshake failure,
    /// 3 version mismatch, 4 address in use, 5 invalid address, 6 other.
    pub fn status_code(&self) -> i32 {
        match self {
            ConnectError::NoServerFound(_) => 1,
            ConnectError::HandshakeTimeout(_) => 2,
            ConnectError::UnsupportedVersion { .. } => 3,
            ConnectError::AddressInUse(_) => 4,
            ConnectError::InvalidAddress(_) => 5,
            ConnectError::Spawn(_) | ConnectError::Io(_) => 6,
        }
    }

    /// Classify a bind failure.
    pub(crate) fn from_bind(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
                ConnectError::AddressInUse(err)
            }
            _ => ConnectError::Io(err),
        }
    }
}

/// Errors produced while decoding a single datagram. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unsupported NatNet protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
}

/// Errors produced while encoding a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Payload of {0} bytes does not fit a u16 length prefix")]
    PayloadTooLarge(usize),
}

/// Outcome of a failed [`Transport::receive`](crate::transport::Transport::receive).
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

/// Status code for a connect result: 0 on success.
pub fn status_code<T>(result: &std::result::Result<T, ConnectError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}
