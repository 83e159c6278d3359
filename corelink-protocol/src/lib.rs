//! # corelink-protocol
//!
//! Wire protocol implementation for corelink.
//!
//! This crate provides:
//! - Binary packet framing with a 20-byte big-endian preamble
//! - Streaming frame decoding with bounded-payload enforcement
//! - Semicolon-delimited `k=v;` header maps
//! - Ordered packet transform chains (plugins)
//! - Body codec registry (JSON, MsgPack)
//! - Status codes and protocol errors

pub mod codec;
pub mod error;
pub mod header;
pub mod packet;
pub mod plugin;
pub mod status;

pub use codec::{BodyCodec, CodecRegistry, JsonCodec, MsgPackCodec};
pub use error::ProtocolError;
pub use header::HeaderMap;
pub use packet::{operator_code, FrameDecoder, Packet, PREAMBLE_SIZE};
pub use plugin::{DebugPlugin, PacketPlugin};
pub use status::{status_text, STATUS_INTERNAL_SERVER_ERROR, STATUS_OK, STATUS_REQUEST_TIMEOUT};

/// Default maximum framed packet size in bytes (preamble + header + body).
pub const MAX_PAYLOAD: u32 = 2048;

/// Operator code of heartbeat frames.
pub const OPERATOR_HEARTBEAT: u32 = 0;

/// Operator codes at or below this value are reserved for the framework.
pub const OPERATOR_RESERVED_MAX: u32 = 1024;
