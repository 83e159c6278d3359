//! Body codec registry.
//!
//! A codec maps between dynamic body values and raw bytes. The registry is
//! keyed by content-type name and selected at server or client
//! configuration time. Registration is strict: registering the same name
//! twice is a configuration bug and panics.

use crate::error::ProtocolError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Content type of the JSON body codec.
pub const JSON: &str = "text/json";

/// Content type of the MsgPack body codec.
pub const MSGPACK: &str = "application/msgpack";

/// Encodes and decodes packet bodies for one content type.
pub trait BodyCodec: std::fmt::Debug + Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError>;
    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError>;
}

/// JSON bodies via serde_json.
#[derive(Debug)]
pub struct JsonCodec;

impl BodyCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::CodecEncode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::CodecDecode(e.to_string()))
    }
}

/// MsgPack bodies via rmp-serde.
#[derive(Debug)]
pub struct MsgPackCodec;

impl BodyCodec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(value).map_err(|e| ProtocolError::CodecEncode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        rmp_serde::from_slice(data).map_err(|e| ProtocolError::CodecDecode(e.to_string()))
    }
}

/// Name → codec registry.
pub struct CodecRegistry {
    adapters: HashMap<String, Arc<dyn BodyCodec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in JSON and MsgPack codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(JSON, Arc::new(JsonCodec));
        registry.register(MSGPACK, Arc::new(MsgPackCodec));
        registry
    }

    /// Registers a codec under a content-type name.
    ///
    /// Panics if the name is already registered.
    pub fn register(&mut self, name: &str, codec: Arc<dyn BodyCodec>) {
        if self.adapters.contains_key(name) {
            panic!("codec: register called twice for adapter {name}");
        }
        self.adapters.insert(name.to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BodyCodec>, ProtocolError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::CodecUnknown(name.to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Process-wide registry with the built-in codecs, for configurations that
/// do not thread their own.
pub fn default_registry() -> &'static CodecRegistry {
    static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    REGISTRY.get_or_init(CodecRegistry::with_defaults)
}
