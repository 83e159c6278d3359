//! Ordered packet transform chains.
//!
//! A plugin rewrites the header and body of a packet on its way in or out
//! of the process. Two chains are configured per server and per client:
//! one applied to inbound packets before dispatch, one applied to outbound
//! packets before write. A failing plugin aborts that packet only.

use crate::error::ProtocolError;
use bytes::Bytes;
use std::sync::Arc;

/// A transform applied to packet header and body bytes.
pub trait PacketPlugin: Send + Sync {
    fn transform(&self, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes), ProtocolError>;
}

/// Runs header and body through a chain of plugins in order.
pub fn apply_chain(
    plugins: &[Arc<dyn PacketPlugin>],
    mut header: Bytes,
    mut body: Bytes,
) -> Result<(Bytes, Bytes), ProtocolError> {
    for plugin in plugins {
        (header, body) = plugin.transform(header, body)?;
    }
    Ok((header, body))
}

/// Identity transform that logs packet contents.
pub struct DebugPlugin {
    /// True on the outbound chain, false on the inbound chain.
    pub sender: bool,
}

impl DebugPlugin {
    pub fn new(sender: bool) -> Self {
        Self { sender }
    }
}

impl PacketPlugin for DebugPlugin {
    fn transform(&self, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes), ProtocolError> {
        let direction = if self.sender { "send" } else { "receive" };
        tracing::debug!(
            "[{} packet] header: {:?} body: {:?}",
            direction,
            String::from_utf8_lossy(&header),
            String::from_utf8_lossy(&body),
        );
        Ok((header, body))
    }
}
