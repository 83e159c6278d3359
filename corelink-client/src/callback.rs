//! Reply views and request status callbacks.

use crate::error::ClientError;
use bytes::Bytes;
use corelink_protocol::codec::BodyCodec;
use corelink_protocol::{HeaderMap, ProtocolError};
use serde_json::Value;
use std::sync::Arc;

/// A decoded reply delivered to a waiting caller or message listener.
#[derive(Clone)]
pub struct Reply {
    pub operator: u32,
    pub sequence: i64,
    pub header: HeaderMap,
    pub body: Bytes,
    pub(crate) codec: Arc<dyn BodyCodec>,
}

impl Reply {
    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.header.get(key)
    }

    /// Decodes the reply body through the client's content type. An empty
    /// body decodes as `null`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        let value = if self.body.is_empty() {
            Value::Null
        } else {
            self.codec.decode(&self.body)?
        };
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::CodecDecode(e.to_string()).into())
    }
}

/// Status callbacks for one request.
///
/// `on_progress(0, "processing")` fires before the packet is queued and
/// `(100, "successful")` after a success reply; `on_error` fires when the
/// reply header carries a `code=` property or the wait times out.
#[derive(Default)]
pub struct RequestStatusCallback {
    pub on_start: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_success: Option<Box<dyn Fn(&Reply) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(i32, &str) + Send + Sync>>,
    pub on_progress: Option<Box<dyn Fn(i32, &str) + Send + Sync>>,
    pub on_end: Option<Box<dyn Fn() + Send + Sync>>,
}

impl RequestStatusCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_success<F: Fn(&Reply) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F: Fn(i32, &str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_progress<F: Fn(i32, &str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_end<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    pub(crate) fn start(&self) {
        if let Some(f) = &self.on_start {
            f();
        }
    }

    pub(crate) fn success(&self, reply: &Reply) {
        if let Some(f) = &self.on_success {
            f(reply);
        }
    }

    pub(crate) fn error(&self, code: i32, message: &str) {
        if let Some(f) = &self.on_error {
            f(code, message);
        }
    }

    pub(crate) fn progress(&self, progress: i32, status: &str) {
        if let Some(f) = &self.on_progress {
            f(progress, status);
        }
    }

    pub(crate) fn end(&self) {
        if let Some(f) = &self.on_end {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_protocol::codec::JsonCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(header: &[u8], body: &'static [u8]) -> Reply {
        Reply {
            operator: 7777,
            sequence: 1,
            header: HeaderMap::parse(header),
            body: Bytes::from_static(body),
            codec: Arc::new(JsonCodec),
        }
    }

    #[test]
    fn test_parse_body() {
        #[derive(serde::Deserialize)]
        struct Body {
            x: i32,
        }
        let body: Body = reply(b"", b"{\"x\":3}").parse().unwrap();
        assert_eq!(body.x, 3);
    }

    #[test]
    fn test_parse_empty_body_as_null() {
        let value: Value = reply(b"", b"").parse().unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_properties() {
        let reply = reply(b"code=500;message=kaput;", b"");
        assert_eq!(reply.get_property("code"), Some("500"));
        assert_eq!(reply.get_property("message"), Some("kaput"));
        assert_eq!(reply.get_property("missing"), None);
    }

    #[test]
    fn test_unset_callbacks_are_noops() {
        let callbacks = RequestStatusCallback::new();
        callbacks.start();
        callbacks.error(500, "x");
        callbacks.progress(0, "processing");
        callbacks.end();
    }

    #[test]
    fn test_builder_wires_callbacks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let callbacks = RequestStatusCallback::new()
            .on_start(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(|code, _| assert_eq!(code, 500));

        callbacks.start();
        callbacks.error(500, "x");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
