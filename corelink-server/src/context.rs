//! Per-request contexts.
//!
//! A context is created for each inbound packet and owned by the task
//! handling it. It carries the request view, the mutable response headers,
//! a key/value scratch map, and a clonable handle to the connection's
//! outbound queue, never the socket itself. The first call to `success`
//! or `error` is authoritative; if a handler returns without replying,
//! the dispatcher emits one empty success.

use crate::broker::MessageHandler;
use crate::error::ServerError;
use crate::server::ServerConfig;
use bytes::Bytes;
use corelink_protocol::{operator_code, HeaderMap, Packet};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Scratch key of the node id minted on connection accept.
pub const NODE_ID_KEY: &str = "corelink-node-id";

/// Scratch key of the last internal error message, set before the error
/// hook runs.
pub const INTERNAL_ERROR_KEY: &str = "corelink-internal-error";

/// Where encoded reply frames go. One implementation per transport.
pub trait ReplySink: Send + Sync {
    /// Queues one whole frame for write. Frames sent after the connection
    /// closed are silently discarded.
    fn send(&self, frame: Bytes);

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Reply sink backed by a connection's outbound queue (TCP, WebSocket).
pub(crate) struct QueueSink {
    pub tx: mpsc::Sender<Bytes>,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

impl ReplySink for QueueSink {
    fn send(&self, frame: Bytes) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("reply dropped: connection closed");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("reply dropped: outbound queue full");
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

/// Reply sink addressing one datagram's source.
pub(crate) struct UdpSink {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

impl ReplySink for UdpSink {
    fn send(&self, frame: Bytes) {
        let socket = self.socket.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&frame, peer).await {
                tracing::debug!("udp reply to {} dropped: {}", peer, e);
            }
        });
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Request view: header and body of the inbound packet after the receive
/// plugin chain.
#[derive(Debug, Clone, Default)]
pub struct RequestView {
    pub header: HeaderMap,
    pub body: Bytes,
}

/// Response view: headers stamped onto the reply packet.
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub header: HeaderMap,
}

/// Per-request handle passed to middleware and handlers.
#[derive(Clone)]
pub struct Context {
    operator: u32,
    sequence: i64,
    pub request: RequestView,
    pub response: ResponseView,
    values: HashMap<String, String>,
    replied: bool,
    sink: Arc<dyn ReplySink>,
    config: Arc<ServerConfig>,
}

impl Context {
    pub(crate) fn new(
        operator: u32,
        sequence: i64,
        header: HeaderMap,
        body: Bytes,
        sink: Arc<dyn ReplySink>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            operator,
            sequence,
            request: RequestView { header, body },
            response: ResponseView::default(),
            values: HashMap::new(),
            replied: false,
            sink,
            config,
        }
    }

    /// Creates a packet-less context for the open and close hooks.
    pub(crate) fn bare(sink: Arc<dyn ReplySink>, config: Arc<ServerConfig>) -> Self {
        Self::new(0, 0, HeaderMap::new(), Bytes::new(), sink, config)
    }

    pub fn operator(&self) -> u32 {
        self.operator
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Stores a scratch value for this request.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The node id minted when this connection was accepted. Absent on UDP.
    pub fn node_id(&self) -> Option<&str> {
        self.get(NODE_ID_KEY)
    }

    /// The message of the last caught handler panic, if any.
    pub fn internal_error(&self) -> Option<&str> {
        self.get(INTERNAL_ERROR_KEY)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sink.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.sink.remote_addr()
    }

    pub fn set_request_property(&mut self, key: &str, value: &str) {
        self.request.header.set(key, value);
    }

    pub fn get_request_property(&self, key: &str) -> Option<&str> {
        self.request.header.get(key)
    }

    pub fn set_response_property(&mut self, key: &str, value: &str) {
        self.response.header.set(key, value);
    }

    pub fn get_response_property(&self, key: &str) -> Option<&str> {
        self.response.header.get(key)
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.request.body
    }

    /// Decodes the request body through the configured content type.
    pub fn parse_param<T: serde::de::DeserializeOwned>(&self) -> Result<T, ServerError> {
        let value = if self.request.body.is_empty() {
            Value::Null
        } else {
            let codec = self.config.codecs.get(&self.config.content_type)?;
            codec.decode(&self.request.body)?
        };
        serde_json::from_value(value)
            .map_err(|e| corelink_protocol::ProtocolError::CodecDecode(e.to_string()).into())
    }

    pub(crate) fn replied(&self) -> bool {
        self.replied
    }

    /// Replies success with an encoded body. `Value::Null` sends an empty
    /// body. Only the first reply on a context is sent.
    pub fn success(&mut self, body: Value) -> Result<(), ServerError> {
        if self.replied {
            return Ok(());
        }
        self.replied = true;

        let body = if body.is_null() {
            Bytes::new()
        } else {
            let codec = self.config.codecs.get(&self.config.content_type)?;
            Bytes::from(codec.encode(&body)?)
        };

        self.reply(self.operator, self.sequence, body)
    }

    /// Replies an error: `code=` and `message=` response properties, empty
    /// body. Only the first reply on a context is sent.
    pub fn error(&mut self, code: i32, message: &str) -> Result<(), ServerError> {
        if self.replied {
            return Ok(());
        }
        self.replied = true;

        self.response.header.set("code", &code.to_string());
        self.response.header.set("message", message);
        self.reply(self.operator, self.sequence, Bytes::new())
    }

    /// Sends a server-initiated message on an operator channel, outside of
    /// any request/response exchange (sequence 0).
    pub fn write(&self, operator: &str, body: Value) -> Result<(), ServerError> {
        let codec = self.config.codecs.get(&self.config.content_type)?;
        let body = Bytes::from(codec.encode(&body)?);
        self.reply(operator_code(operator), 0, body)
    }

    fn reply(&self, operator: u32, sequence: i64, body: Bytes) -> Result<(), ServerError> {
        let packet = Packet::with_plugins(
            operator,
            sequence,
            self.response.header.encode(),
            body,
            &self.config.send_plugins,
        )?;
        self.sink.send(packet.encode().freeze());
        Ok(())
    }

    /// Publishes a message to a broker topic through the configured codec.
    pub fn publish(&self, topic: &str, message: Value) -> Result<(), ServerError> {
        let broker = self.config.broker.as_ref().ok_or(ServerError::NoBroker)?;
        let codec = self.config.codecs.get(&self.config.content_type)?;
        let data = Bytes::from(codec.encode(&message)?);
        broker.publish(topic, data)
    }

    /// Subscribes this connection's node to a broker topic.
    pub fn subscribe(&self, topic: &str, on_message: MessageHandler) -> Result<(), ServerError> {
        let broker = self.config.broker.as_ref().ok_or(ServerError::NoBroker)?;
        let node_id = self.node_id().ok_or(ServerError::NoNodeId)?;
        broker.subscribe(node_id, topic, on_message)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), ServerError> {
        let broker = self.config.broker.as_ref().ok_or(ServerError::NoBroker)?;
        let node_id = self.node_id().ok_or(ServerError::NoNodeId)?;
        broker.unsubscribe(node_id, topic)
    }

    pub fn unsubscribe_all(&self) -> Result<(), ServerError> {
        let broker = self.config.broker.as_ref().ok_or(ServerError::NoBroker)?;
        let node_id = self.node_id().ok_or(ServerError::NoNodeId)?;
        broker.unsubscribe_all(node_id)
    }
}
