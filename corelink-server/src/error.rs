//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] corelink_protocol::ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("read deadline elapsed")]
    ReadTimeout,

    #[error("operator {operator} for pattern {pattern:?} is reserved (must be > 1024)")]
    ReservedOperator { pattern: String, operator: u32 },

    #[error("pattern {0:?} is already bound")]
    OperatorBound(String),

    #[error("no broker configured")]
    NoBroker,

    #[error("context has no node id")]
    NoNodeId,

    #[error("broker error: {0}")]
    Broker(String),
}

impl ServerError {
    /// Returns whether this error tears down the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::ReadTimeout | ServerError::WebSocket(_) => true,
            ServerError::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }
}
