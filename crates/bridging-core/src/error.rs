use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum BridgingError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no gateway connected")]
    NotConnected,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BridgingError {
    fn from(e: serde_json::Error) -> Self {
        BridgingError::Codec(e.to_string())
    }
}

pub type BridgingResult<T> = Result<T, BridgingError>;
