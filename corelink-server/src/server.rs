//! Server runtime options and transport entrypoints.

use crate::broker::Broker;
use crate::context::Context;
use crate::error::ServerError;
use crate::router::{Handler, Router};
use corelink_protocol::codec::CodecRegistry;
use corelink_protocol::{PacketPlugin, MAX_PAYLOAD};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

/// Default socket read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default write buffer size for the per-connection writer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Default WebSocket upgrade path.
pub const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";

/// Runtime options shared by every connection of a server.
pub struct ServerConfig {
    /// Log request/response traffic at debug level.
    pub debug: bool,
    /// Socket read chunk size.
    pub read_buffer_size: usize,
    /// Writer buffering per connection.
    pub write_buffer_size: usize,
    /// Per-read deadline; `Duration::ZERO` disables the deadline.
    pub timeout: Duration,
    /// Maximum framed packet size accepted by the reader.
    pub max_payload: u32,
    /// Content type selecting the body codec for replies and publishes.
    pub content_type: String,
    /// WebSocket upgrade path; `<path>/websocket` is accepted as a legacy
    /// alias.
    pub websocket_path: String,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) broker: Option<Arc<dyn Broker>>,
    pub(crate) send_plugins: Vec<Arc<dyn PacketPlugin>>,
    pub(crate) receive_plugins: Vec<Arc<dyn PacketPlugin>>,
    pub(crate) on_error: Option<Handler>,
    pub(crate) on_open: Option<Handler>,
    pub(crate) on_close: Option<Handler>,
    pub(crate) on_ping: Option<Handler>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            debug: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            timeout: Duration::ZERO,
            max_payload: MAX_PAYLOAD,
            content_type: corelink_protocol::codec::JSON.to_string(),
            websocket_path: DEFAULT_WEBSOCKET_PATH.to_string(),
            codecs: Arc::new(CodecRegistry::with_defaults()),
            broker: None,
            send_plugins: Vec::new(),
            receive_plugins: Vec::new(),
            on_error: None,
            on_open: None,
            on_close: None,
            on_ping: None,
        }
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1024);
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size.max(1024);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    pub fn with_websocket_path(mut self, path: impl Into<String>) -> Self {
        self.websocket_path = path.into();
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn with_broker<B: Broker + 'static>(mut self, broker: B) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Appends a plugin to the outbound transform chain.
    pub fn with_send_plugin(mut self, plugin: Arc<dyn PacketPlugin>) -> Self {
        self.send_plugins.push(plugin);
        self
    }

    /// Appends a plugin to the inbound transform chain.
    pub fn with_receive_plugin(mut self, plugin: Arc<dyn PacketPlugin>) -> Self {
        self.receive_plugins.push(plugin);
        self
    }

    /// Hook run after a handler panic was recorded on the context.
    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Hook run with a bare context when a connection is accepted.
    pub fn with_on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Hook run with a bare context when a connection closes.
    pub fn with_on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Hook run on each heartbeat frame, before the empty success reply.
    pub fn with_on_ping<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.on_ping = Some(Arc::new(hook));
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("debug", &self.debug)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("timeout", &self.timeout)
            .field("max_payload", &self.max_payload)
            .field("content_type", &self.content_type)
            .field("websocket_path", &self.websocket_path)
            .field("broker", &self.broker.is_some())
            .field("send_plugins", &self.send_plugins.len())
            .field("receive_plugins", &self.receive_plugins.len())
            .finish()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

pub(crate) struct ServerShared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) router: Router,
    pub(crate) stats: Arc<ServerStats>,
}

/// Multi-transport corelink server.
///
/// The router is fixed at construction; `run_tcp`, `run_websocket` and
/// `run_udp` may serve concurrently over the same routes.
pub struct Server {
    shared: Arc<ServerShared>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(ServerShared {
                config: Arc::new(config),
                router,
                stats: Arc::new(ServerStats::default()),
            }),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Serves framed packets over TCP until shutdown.
    pub async fn run_tcp(&self, addr: SocketAddr) -> Result<(), ServerError> {
        self.run_tcp_listener(TcpListener::bind(addr).await?).await
    }

    /// Serves framed packets over a pre-bound TCP listener until shutdown.
    pub async fn run_tcp_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        tracing::info!("Listening and serving TCP on {}", listener.local_addr()?);
        self.running.store(true, Ordering::SeqCst);
        let result = crate::tcp::serve(
            self.shared.clone(),
            listener,
            self.shutdown.subscribe(),
        )
        .await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Serves one binary WebSocket message per packet until shutdown.
    pub async fn run_websocket(&self, addr: SocketAddr) -> Result<(), ServerError> {
        self.run_websocket_listener(TcpListener::bind(addr).await?)
            .await
    }

    /// Serves WebSocket upgrades on a pre-bound listener until shutdown.
    pub async fn run_websocket_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        tracing::info!(
            "Listening and serving WebSocket on {}{}",
            listener.local_addr()?,
            self.shared.config.websocket_path,
        );
        self.running.store(true, Ordering::SeqCst);
        let result = crate::websocket::serve(
            self.shared.clone(),
            listener,
            self.shutdown.subscribe(),
        )
        .await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Serves one framed packet per datagram until shutdown.
    pub async fn run_udp(&self, addr: SocketAddr) -> Result<(), ServerError> {
        self.run_udp_socket(UdpSocket::bind(addr).await?).await
    }

    /// Serves datagrams on a pre-bound UDP socket until shutdown.
    pub async fn run_udp_socket(&self, socket: UdpSocket) -> Result<(), ServerError> {
        tracing::info!("Listening and serving UDP on {}", socket.local_addr()?);
        self.running.store(true, Ordering::SeqCst);
        let result = crate::udp::serve(
            self.shared.clone(),
            socket,
            self.shutdown.subscribe(),
        )
        .await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Initiates shutdown of every running transport loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}
