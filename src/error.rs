use thiserror::Error;

/// Errors surfaced by the runtime core.
///
/// Transport failures kill the endpoint they occurred on but never the
/// process; registration and configuration failures at startup are fatal.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection is closing")]
    ConnIsClosing,

    #[error("connection outbound queue overflow")]
    ConnOutboundOverflow,

    #[error("connection forced to close")]
    ConnForceClose,

    #[error("executor is closed")]
    ExecutorClosed,

    #[error("packet dispatch context is empty")]
    PacketContextEmpty,

    #[error("destination not reachable")]
    DestinationNotReachable,

    #[error("outbound queue overflow")]
    OutboundQueueOverflow,

    #[error("packet {command} payload size overflow {size}/{limit}")]
    PayloadOverflow {
        command: u32,
        size: usize,
        limit: usize,
    },

    #[error("packet {command} checksum mismatch {expect:08x} != {actual:08x}")]
    ChecksumMismatch {
        command: u32,
        expect: u32,
        actual: u32,
    },

    #[error("packet {0} is encrypted but no decryptor is installed")]
    MissingDecryptor(u32),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("registration denied: {0}")]
    RegistrationDenied(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("message {command} carried errno {errno}")]
    Errno { command: u32, errno: u32 },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl From<bincode::error::EncodeError> for NetError {
    fn from(e: bincode::error::EncodeError) -> Self {
        NetError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for NetError {
    fn from(e: bincode::error::DecodeError) -> Self {
        NetError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        NetError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NetError::WebSocket(e.to_string())
    }
}
