//! Client engine.
//!
//! One persistent TCP connection carries any number of concurrent calls:
//! outbound packets drain through a writer task, a reader task routes
//! replies to waiters by correlation key, and a supervisor reconnects on
//! a fixed interval after transport errors. The correlation key of a call
//! is `i64(crc32(operator)) + sequence`; message listeners are keyed by
//! `i64(crc32(operator))` alone and match any sequence, which is how
//! server-initiated pushes (sequence 0) find them.

use crate::callback::{Reply, RequestStatusCallback};
use crate::error::ClientError;
use bytes::Bytes;
use corelink_protocol::codec::CodecRegistry;
use corelink_protocol::{
    operator_code, plugin, FrameDecoder, HeaderMap, Packet, PacketPlugin, MAX_PAYLOAD,
    OPERATOR_HEARTBEAT, STATUS_REQUEST_TIMEOUT,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Capacity of the outbound packet queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Client configuration.
pub struct ClientConfig {
    /// Default wait for `sync_call`.
    pub timeout: Duration,
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts.
    pub retry_interval: Duration,
    /// Maximum framed packet size accepted from the server.
    pub max_payload: u32,
    /// Content type selecting the body codec.
    pub content_type: String,
    /// Socket read chunk size.
    pub read_buffer_size: usize,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) send_plugins: Vec<Arc<dyn PacketPlugin>>,
    pub(crate) receive_plugins: Vec<Arc<dyn PacketPlugin>>,
    pub(crate) on_state_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_payload: MAX_PAYLOAD,
            content_type: corelink_protocol::codec::JSON.to_string(),
            read_buffer_size: 4096,
            codecs: Arc::new(CodecRegistry::with_defaults()),
            send_plugins: Vec::new(),
            receive_plugins: Vec::new(),
            on_state_change: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn with_send_plugin(mut self, plugin: Arc<dyn PacketPlugin>) -> Self {
        self.send_plugins.push(plugin);
        self
    }

    pub fn with_receive_plugin(mut self, plugin: Arc<dyn PacketPlugin>) -> Self {
        self.receive_plugins.push(plugin);
        self
    }

    /// Fired with `true`/`false` on every connection state transition.
    pub fn with_on_connection_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

enum Entry {
    Call {
        callbacks: Arc<RequestStatusCallback>,
        done: Option<oneshot::Sender<()>>,
    },
    Listener(Arc<dyn Fn(&Reply) + Send + Sync>),
}

struct ClientInner {
    config: ClientConfig,
    addr: String,
    entries: DashMap<i64, Entry>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    request_header: Mutex<HeaderMap>,
    timeout_ms: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
    heartbeat_cancel: broadcast::Sender<()>,
}

impl ClientInner {
    fn notify_state(&self, connected: bool) {
        if let Some(f) = &self.config.on_state_change {
            f(connected);
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Routes one inbound packet to its waiter or listener.
    fn dispatch_reply(&self, packet: Packet) {
        let (header, body) =
            match plugin::apply_chain(&self.config.receive_plugins, packet.header, packet.body) {
                Ok(transformed) => transformed,
                Err(e) => {
                    tracing::warn!("inbound plugin dropped reply: {}", e);
                    return;
                }
            };

        let codec = match self.config.codecs.get(&self.config.content_type) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!("dropping reply: {}", e);
                return;
            }
        };

        let reply = Reply {
            operator: packet.operator,
            sequence: packet.sequence,
            header: HeaderMap::parse(&header),
            body,
            codec,
        };

        let key = (packet.operator as i64).wrapping_add(packet.sequence);
        if let Some((_, entry)) = self
            .entries
            .remove_if(&key, |_, entry| matches!(entry, Entry::Call { .. }))
        {
            if let Entry::Call { callbacks, done } = entry {
                Self::fire(&callbacks, &reply);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            return;
        }

        // Message listeners match any sequence on their operator channel.
        // The map guard is released before the handler runs so the handler
        // may touch the client (add/remove listeners) without deadlocking.
        let listener = self
            .entries
            .get(&(packet.operator as i64))
            .and_then(|entry| match entry.value() {
                Entry::Listener(handler) => Some(handler.clone()),
                Entry::Call { .. } => None,
            });
        if let Some(handler) = listener {
            handler(&reply);
        }
    }

    fn fire(callbacks: &RequestStatusCallback, reply: &Reply) {
        match reply.get_property("code") {
            Some(code) => {
                let code = code.parse().unwrap_or(corelink_protocol::STATUS_INTERNAL_SERVER_ERROR);
                let message = reply.get_property("message").unwrap_or("");
                callbacks.error(code, message);
            }
            None => {
                callbacks.success(reply);
                callbacks.progress(100, "successful");
            }
        }
        callbacks.end();
    }
}

/// Multiplexing client over one persistent connection.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects to a server, blocking until the first connection succeeds
    /// or the connect timeout elapses, then keeps the connection alive in
    /// the background until `close`.
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        let (heartbeat_cancel, _) = broadcast::channel(1);

        let timeout_ms = AtomicU64::new(config.timeout.as_millis() as u64);
        let inner = Arc::new(ClientInner {
            config,
            addr: addr.clone(),
            entries: DashMap::new(),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            request_header: Mutex::new(HeaderMap::new()),
            timeout_ms,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            heartbeat_cancel,
        });

        let stream = tokio::time::timeout(
            inner.config.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        inner.connected.store(true, Ordering::SeqCst);
        inner.notify_state(true);
        tracing::debug!("connected to {}", addr);

        tokio::spawn(supervise(inner.clone(), stream));
        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Changes the default `sync_call` wait.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Sets a property sent in the header of every outbound request.
    pub fn set_request_property(&self, key: &str, value: &str) {
        self.inner.request_header.lock().unwrap().set(key, value);
    }

    pub fn get_request_property(&self, key: &str) -> Option<String> {
        self.inner
            .request_header
            .lock()
            .unwrap()
            .get(key)
            .map(String::from)
    }

    /// Sends a request and waits for its terminal callback or the timeout.
    ///
    /// Concurrent `sync_call`s are allowed; replies are routed by
    /// correlation key, so callers never block each other.
    pub async fn sync_call(
        &self,
        operator: &str,
        param: Value,
        callbacks: RequestStatusCallback,
    ) -> Result<(), ClientError> {
        self.call(operator, param, callbacks, true).await
    }

    /// Sends a request and returns once it is queued; the callback fires on
    /// reply or is orphaned at disconnect.
    pub async fn async_call(
        &self,
        operator: &str,
        param: Value,
        callbacks: RequestStatusCallback,
    ) -> Result<(), ClientError> {
        self.call(operator, param, callbacks, false).await
    }

    async fn call(
        &self,
        operator: &str,
        param: Value,
        callbacks: RequestStatusCallback,
        wait: bool,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || !inner.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let callbacks = Arc::new(callbacks);
        callbacks.start();

        let body = if param.is_null() {
            Bytes::new()
        } else {
            let codec = inner.config.codecs.get(&inner.config.content_type)?;
            Bytes::from(codec.encode(&param)?)
        };

        let op = operator_code(operator);
        let sequence = monotonic_nanos();
        let key = (op as i64).wrapping_add(sequence);

        let (done, done_rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        inner.entries.insert(
            key,
            Entry::Call {
                callbacks: callbacks.clone(),
                done,
            },
        );

        callbacks.progress(0, "processing");

        let header = inner.request_header.lock().unwrap().encode();
        let packet =
            match Packet::with_plugins(op, sequence, header, body, &inner.config.send_plugins) {
                Ok(packet) => packet,
                Err(e) => {
                    inner.entries.remove(&key);
                    return Err(e.into());
                }
            };

        if inner.outbound_tx.send(packet).await.is_err() {
            inner.entries.remove(&key);
            return Err(ClientError::NotConnected);
        }

        let Some(done_rx) = done_rx else {
            return Ok(());
        };

        match tokio::time::timeout(inner.timeout(), done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // The entry was cleared at close or disconnect; no callback
                // fired.
                inner.entries.remove(&key);
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                // Only deliver the timeout if the reply has not won the race.
                if inner.entries.remove(&key).is_some() {
                    callbacks.error(STATUS_REQUEST_TIMEOUT, "request timeout");
                    callbacks.end();
                    Err(ClientError::Timeout)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Installs a permanent handler for server-initiated messages on an
    /// operator channel, matching any sequence.
    pub fn add_message_listener<F>(&self, operator: &str, handler: F)
    where
        F: Fn(&Reply) + Send + Sync + 'static,
    {
        self.inner.entries.insert(
            operator_code(operator) as i64,
            Entry::Listener(Arc::new(handler)),
        );
    }

    pub fn remove_message_listener(&self, operator: &str) {
        self.inner.entries.remove(&(operator_code(operator) as i64));
    }

    /// Encodes `param` once, sends a heartbeat immediately, then on every
    /// tick until `stop_heartbeat` or `close`.
    pub async fn start_heartbeat(
        &self,
        interval: Duration,
        param: Value,
    ) -> Result<(), ClientError> {
        let inner = self.inner.clone();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let body = if param.is_null() {
            Bytes::new()
        } else {
            let codec = inner.config.codecs.get(&inner.config.content_type)?;
            Bytes::from(codec.encode(&param)?)
        };
        let header = inner.request_header.lock().unwrap().encode();
        let packet = Packet::with_plugins(
            OPERATOR_HEARTBEAT,
            monotonic_nanos(),
            header,
            body,
            &inner.config.send_plugins,
        )?;

        if inner.outbound_tx.send(packet.clone()).await.is_err() {
            return Err(ClientError::NotConnected);
        }

        let mut cancel = inner.heartbeat_cancel.subscribe();
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the immediate send above covers this tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if inner.outbound_tx.send(packet.clone()).await.is_err() {
                            return;
                        }
                    }
                    _ = cancel.recv() => return,
                    _ = shutdown.recv() => return,
                }
            }
        });
        Ok(())
    }

    pub fn stop_heartbeat(&self) {
        let _ = self.inner.heartbeat_cancel.send(());
    }

    /// Stops the heartbeat, the connection tasks and the reconnection
    /// supervisor. Idempotent. Waiting `sync_call`s observe
    /// `ConnectionClosed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self.inner.heartbeat_cancel.send(());
        let _ = self.inner.shutdown.send(());
        self.inner.entries.clear();
        tracing::debug!("client closed");
    }

    /// Number of pending correlation entries (calls and listeners).
    pub fn pending_count(&self) -> usize {
        self.inner.entries.len()
    }
}

/// Runs reader and writer for one connection after another, reconnecting
/// on transport errors until close.
async fn supervise(inner: Arc<ClientInner>, mut stream: TcpStream) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let shutting_down = run_connection(&inner, stream).await;
        if shutting_down || inner.closed.load(Ordering::SeqCst) {
            return;
        }

        inner.connected.store(false, Ordering::SeqCst);
        inner.notify_state(false);
        // In-flight calls cannot complete on the next connection; drop them
        // so waiters wake with ConnectionClosed. Listeners persist.
        inner
            .entries
            .retain(|_, entry| matches!(entry, Entry::Listener(_)));
        tracing::debug!("connection lost, reconnecting to {}", inner.addr);

        stream = loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.retry_interval) => {}
                _ = shutdown.recv() => return,
            }
            match TcpStream::connect(&inner.addr).await {
                Ok(stream) => break stream,
                Err(e) => tracing::debug!("reconnect to {} failed: {}", inner.addr, e),
            }
        };

        inner.connected.store(true, Ordering::SeqCst);
        inner.notify_state(true);
        tracing::debug!("reconnected to {}", inner.addr);
    }
}

/// Returns true if the connection ended because the client is closing.
async fn run_connection(inner: &Arc<ClientInner>, stream: TcpStream) -> bool {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();

    let (dead_tx, dead_rx) = watch::channel(false);
    let writer = tokio::spawn(write_task(inner.clone(), write_half, dead_rx));

    let shutting_down = read_task(inner, read_half).await;

    let _ = dead_tx.send(true);
    let _ = writer.await;
    shutting_down
}

async fn write_task(
    inner: Arc<ClientInner>,
    mut writer: OwnedWriteHalf,
    mut dead: watch::Receiver<bool>,
) {
    // The queue outlives any one connection; the writer borrows it for the
    // connection's lifetime.
    let mut outbound = inner.outbound_rx.lock().await;
    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(packet) => {
                    if writer.write_all(&packet.encode()).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = dead.changed() => return,
        }
    }
}

/// Returns true if the read loop ended because the client is closing.
async fn read_task(inner: &Arc<ClientInner>, mut reader: OwnedReadHalf) -> bool {
    let mut shutdown = inner.shutdown.subscribe();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; inner.config.read_buffer_size];

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("read error: {}", e);
                    return false;
                }
            },
            _ = shutdown.recv() => return true,
        };

        if n == 0 {
            tracing::debug!("server closed the connection");
            return false;
        }
        decoder.extend(&buf[..n]);

        loop {
            match decoder.decode(inner.config.max_payload) {
                Ok(Some(packet)) => inner.dispatch_reply(packet),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("frame error: {}", e);
                    return false;
                }
            }
        }
    }
}

/// Strictly increasing nanosecond timestamps for sequence numbers.
fn monotonic_nanos() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    loop {
        let last = LAST.load(Ordering::Relaxed);
        let candidate = now.max(last + 1);
        if LAST
            .compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.max_payload, MAX_PAYLOAD);
        assert_eq!(config.content_type, "text/json");
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let mut previous = monotonic_nanos();
        for _ in 0..1000 {
            let next = monotonic_nanos();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_correlation_key_matches_listener_key_for_pushes() {
        // Server-initiated messages carry sequence 0, so their correlation
        // key equals the bare listener key.
        let op = operator_code("push/update");
        assert_eq!((op as i64).wrapping_add(0), op as i64);
    }
}
