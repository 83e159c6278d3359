//! Packet dispatch pipeline shared by all transports.
//!
//! Each decoded inbound packet gets its own task: build a context, run the
//! middleware chains, run the handler, and make sure exactly one reply
//! leaves the context. Handler panics are caught per task; the connection
//! they arrived on keeps serving.

use crate::context::{Context, ReplySink, INTERNAL_ERROR_KEY, NODE_ID_KEY};
use crate::server::ServerShared;
use corelink_protocol::{
    status_text, HeaderMap, Packet, OPERATOR_HEARTBEAT, STATUS_INTERNAL_SERVER_ERROR,
};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Reply sent when no handler is bound at the packet's operator.
pub(crate) const ROUTE_MISS_MESSAGE: &str = "server don't register your request.";

/// Runs one inbound packet through middleware and handler.
pub(crate) async fn dispatch(
    shared: Arc<ServerShared>,
    sink: Arc<dyn ReplySink>,
    packet: Packet,
    node_id: Option<String>,
) {
    shared.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    // Receive transform chain. A failing plugin drops this frame only;
    // the error hook sees what happened, the connection keeps serving.
    let packet = match Packet::with_plugins(
        packet.operator,
        packet.sequence,
        packet.header,
        packet.body,
        &shared.config.receive_plugins,
    ) {
        Ok(packet) => packet,
        Err(e) => {
            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("inbound plugin dropped frame: {}", e);
            let mut ctx = Context::bare(sink, shared.config.clone());
            if let Some(id) = &node_id {
                ctx.set(NODE_ID_KEY, id);
            }
            ctx.set(INTERNAL_ERROR_KEY, &e.to_string());
            if let Some(hook) = &shared.config.on_error {
                hook(&mut ctx);
            }
            return;
        }
    };

    let header = HeaderMap::parse(&packet.header);
    let mut ctx = Context::new(
        packet.operator,
        packet.sequence,
        header,
        packet.body,
        sink,
        shared.config.clone(),
    );
    if let Some(id) = &node_id {
        ctx.set(NODE_ID_KEY, id);
    }

    // Heartbeats never reach the user router.
    if packet.operator == OPERATOR_HEARTBEAT {
        if let Some(hook) = &shared.config.on_ping {
            hook(&mut ctx);
        }
        if let Err(e) = ctx.success(Value::Null) {
            tracing::debug!("heartbeat reply failed: {}", e);
        }
        return;
    }

    let Some(handler) = shared.router.handler(packet.operator) else {
        shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("no handler bound at operator {}", packet.operator);
        if let Err(e) = ctx.error(STATUS_INTERNAL_SERVER_ERROR, ROUTE_MISS_MESSAGE) {
            tracing::debug!("route-miss reply failed: {}", e);
        }
        return;
    };

    let mut skip_handler = false;
    for middleware in shared.router.route_middleware(packet.operator) {
        ctx = middleware.handle(ctx);
        if middleware.terminate() {
            skip_handler = true;
        }
    }
    for middleware in shared.router.global_middleware() {
        ctx = middleware.handle(ctx);
        if middleware.terminate() {
            skip_handler = true;
        }
    }

    if !skip_handler {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&mut ctx))) {
            let message = panic_message(panic);
            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("handler at operator {} panicked: {}", packet.operator, message);

            ctx.set(INTERNAL_ERROR_KEY, &message);
            if let Some(hook) = &shared.config.on_error {
                hook(&mut ctx);
            }
            if let Err(e) = ctx.error(STATUS_INTERNAL_SERVER_ERROR, &message) {
                tracing::debug!("panic reply failed: {}", e);
            }
            return;
        }
    }

    // A handler that never replied gets a default empty success.
    if !ctx.replied() {
        if let Err(e) = ctx.success(Value::Null) {
            tracing::debug!("default reply failed: {}", e);
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        status_text(STATUS_INTERNAL_SERVER_ERROR).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueueSink;
    use crate::router::{Middleware, Router};
    use crate::server::{ServerConfig, ServerStats};
    use bytes::Bytes;
    use corelink_protocol::{operator_code, MAX_PAYLOAD};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn shared_with(router: Router) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            config: Arc::new(ServerConfig::new()),
            router,
            stats: Arc::new(ServerStats::default()),
        })
    }

    fn sink_pair(capacity: usize) -> (Arc<dyn ReplySink>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(QueueSink {
                tx,
                local: None,
                remote: None,
            }),
            rx,
        )
    }

    fn request(pattern: &str, body: &'static [u8]) -> Packet {
        Packet::new(operator_code(pattern), 9, Bytes::new(), Bytes::from_static(body))
    }

    fn decode(frame: Bytes) -> Packet {
        let mut buf = bytes::BytesMut::from(&frame[..]);
        Packet::decode(&mut buf, MAX_PAYLOAD).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let mut router = Router::new();
        router
            .bind("echo", |ctx| {
                let body: serde_json::Value = ctx.parse_param().unwrap();
                ctx.success(body).unwrap();
            })
            .unwrap();

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(router), sink, request("echo", b"{\"x\":1}"), None).await;

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply.sequence, 9);
        assert_eq!(reply.body, Bytes::from_static(b"{\"x\":1}"));
    }

    #[tokio::test]
    async fn test_route_miss_replies_500() {
        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(Router::new()), sink, request("nope", b"{}"), None).await;

        let reply = decode(rx.try_recv().unwrap());
        let header = HeaderMap::parse(&reply.header);
        assert_eq!(header.get("code"), Some("500"));
        assert_eq!(header.get("message"), Some(ROUTE_MISS_MESSAGE));
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let mut router = Router::new();
        router
            .bind("boom", |_ctx| {
                panic!("x");
            })
            .unwrap();

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(router), sink, request("boom", b"{}"), None).await;

        let reply = decode(rx.try_recv().unwrap());
        let header = HeaderMap::parse(&reply.header);
        assert_eq!(header.get("code"), Some("500"));
        assert_eq!(header.get("message"), Some("x"));
    }

    #[tokio::test]
    async fn test_silent_handler_gets_empty_success() {
        let mut router = Router::new();
        router.bind("quiet", |_ctx| {}).unwrap();

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(router), sink, request("quiet", b"{}"), None).await;

        let reply = decode(rx.try_recv().unwrap());
        assert!(reply.body.is_empty());
        assert!(HeaderMap::parse(&reply.header).get("code").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_bypasses_router() {
        // Operator 0 with no ping hook and no routes: still an empty success.
        let (sink, mut rx) = sink_pair(4);
        let packet = Packet::new(OPERATOR_HEARTBEAT, 5, Bytes::new(), Bytes::from_static(b"{}"));
        dispatch(shared_with(Router::new()), sink, packet, None).await;

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply.operator, OPERATOR_HEARTBEAT);
        assert_eq!(reply.sequence, 5);
        assert!(reply.body.is_empty());
        assert!(HeaderMap::parse(&reply.header).get("code").is_none());
    }

    #[tokio::test]
    async fn test_failing_receive_plugin_drops_frame() {
        struct Reject;

        impl corelink_protocol::PacketPlugin for Reject {
            fn transform(
                &self,
                _header: Bytes,
                _body: Bytes,
            ) -> Result<(Bytes, Bytes), corelink_protocol::ProtocolError> {
                Err(corelink_protocol::ProtocolError::Plugin("refused".into()))
            }
        }

        let (hook_tx, mut hook_rx) = mpsc::channel(1);
        let config = ServerConfig::new()
            .with_receive_plugin(Arc::new(Reject))
            .with_on_error(move |ctx| {
                let _ = hook_tx.try_send(ctx.internal_error().unwrap_or("").to_string());
            });
        let shared = Arc::new(ServerShared {
            config: Arc::new(config),
            router: {
                let mut router = Router::new();
                router.bind("echo", |_ctx| {}).unwrap();
                router
            },
            stats: Arc::new(ServerStats::default()),
        });

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared, sink, request("echo", b"{}"), None).await;

        // No reply leaves the server; the error hook saw the failure.
        assert!(rx.try_recv().is_err());
        assert!(hook_rx.try_recv().unwrap().contains("refused"));
    }

    struct Stamp(&'static str);

    impl Middleware for Stamp {
        fn handle(&self, mut ctx: Context) -> Context {
            let order = ctx.get("order").unwrap_or("").to_string();
            ctx.set("order", &format!("{}{}", order, self.0));
            ctx
        }
    }

    struct Gate;

    impl Middleware for Gate {
        fn handle(&self, mut ctx: Context) -> Context {
            ctx.error(403, "denied").unwrap();
            ctx
        }

        fn terminate(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_middleware_order_route_then_global() {
        let mut router = Router::new();
        router
            .bind_with(
                "ordered",
                |ctx| {
                    let order = ctx.get("order").unwrap_or("").to_string();
                    ctx.success(json!({ "order": order })).unwrap();
                },
                vec![Arc::new(Stamp("r1")), Arc::new(Stamp("r2"))],
            )
            .unwrap();
        router.use_middleware(Stamp("g1"));
        router.use_middleware(Stamp("g2"));

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(router), sink, request("ordered", b"{}"), None).await;

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply.body, Bytes::from_static(b"{\"order\":\"r1r2g1g2\"}"));
    }

    #[tokio::test]
    async fn test_terminate_skips_handler_but_runs_later_middleware() {
        let mut router = Router::new();
        router
            .bind("gated", |_ctx| {
                panic!("handler must not run");
            })
            .unwrap();
        router.use_middleware(Gate);
        router.use_middleware(Stamp("after"));

        let (sink, mut rx) = sink_pair(4);
        dispatch(shared_with(router), sink, request("gated", b"{}"), None).await;

        // The gate's own reply is the only one.
        let reply = decode(rx.try_recv().unwrap());
        let header = HeaderMap::parse(&reply.header);
        assert_eq!(header.get("code"), Some("403"));
        assert!(rx.try_recv().is_err());
    }
}
