//! Protocol error types.

use thiserror::Error;

/// Errors raised on the wire path: framing, transforms, and body codecs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet larger than max payload: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("short read inside a frame: {needed} more bytes expected")]
    ShortRead { needed: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown codec adapter {0:?}")]
    CodecUnknown(String),

    #[error("codec encode failed: {0}")]
    CodecEncode(String),

    #[error("codec decode failed: {0}")]
    CodecDecode(String),

    #[error("packet plugin failed: {0}")]
    Plugin(String),
}

impl ProtocolError {
    /// Returns whether this error tears down the connection it occurred on.
    ///
    /// Framing and transport errors are fatal; per-frame errors (codec,
    /// plugin) are reported to the caller and the connection continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PayloadTooLarge { .. }
                | ProtocolError::ShortRead { .. }
                | ProtocolError::Io(_)
        )
    }
}
