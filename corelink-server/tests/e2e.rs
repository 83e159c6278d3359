//! End-to-end tests over real sockets: a server per test on an ephemeral
//! port, driven by the corelink client or by raw framed writes.

use corelink_client::{Client, ClientConfig, RequestStatusCallback};
use corelink_protocol::{operator_code, FrameDecoder, HeaderMap, Packet, MAX_PAYLOAD};
use corelink_server::{MemoryBroker, Router, Server, ServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

fn echo_router() -> Router {
    let mut router = Router::new();
    router
        .bind("echo", |ctx| {
            let body: Value = ctx.parse_param().unwrap();
            ctx.success(body).unwrap();
        })
        .unwrap();
    router
}

async fn spawn_tcp_server(router: Router, config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(config, router));
    let background = server.clone();
    tokio::spawn(async move {
        let _ = background.run_tcp_listener(listener).await;
    });
    (server, addr)
}

async fn connect(addr: SocketAddr, config: ClientConfig) -> Client {
    Client::connect("127.0.0.1", addr.port(), config)
        .await
        .unwrap()
}

/// Callback pair collecting the terminal outcome on a channel.
fn outcome_callbacks() -> (RequestStatusCallback, mpsc::Receiver<Result<Value, (i32, String)>>) {
    let (tx, rx) = mpsc::channel(1);
    let success_tx = tx.clone();
    let callbacks = RequestStatusCallback::new()
        .on_success(move |reply| {
            let _ = success_tx.try_send(Ok(reply.parse().unwrap()));
        })
        .on_error(move |code, message| {
            let _ = tx.try_send(Err((code, message.to_string())));
        });
    (callbacks, rx)
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let (_server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;
    let client = connect(addr, ClientConfig::new()).await;

    let (callbacks, mut rx) = outcome_callbacks();
    client
        .sync_call("echo", json!({"x": 1}), callbacks)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"x": 1}));
    assert_eq!(client.pending_count(), 0);
    client.close();
}

#[tokio::test]
async fn test_progress_callbacks_bracket_the_call() {
    let (_server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;
    let client = connect(addr, ClientConfig::new()).await;

    let (tx, mut rx) = mpsc::channel(4);
    let progress_tx = tx.clone();
    let callbacks = RequestStatusCallback::new().on_progress(move |progress, status| {
        let _ = progress_tx.try_send((progress, status.to_string()));
    });
    drop(tx);

    client.sync_call("echo", json!({}), callbacks).await.unwrap();
    client.close();

    assert_eq!(rx.recv().await.unwrap(), (0, "processing".to_string()));
    assert_eq!(rx.recv().await.unwrap(), (100, "successful".to_string()));
}

/// Involutive byte mask; the same plugin undoes itself on the other side.
struct Mask(u8);

impl corelink_protocol::PacketPlugin for Mask {
    fn transform(
        &self,
        header: bytes::Bytes,
        body: bytes::Bytes,
    ) -> Result<(bytes::Bytes, bytes::Bytes), corelink_protocol::ProtocolError> {
        let key = self.0;
        let flip =
            |data: bytes::Bytes| bytes::Bytes::from(data.iter().map(|b| b ^ key).collect::<Vec<u8>>());
        Ok((flip(header), flip(body)))
    }
}

#[tokio::test]
async fn test_packet_plugins_roundtrip() {
    let server_config = ServerConfig::new()
        .with_receive_plugin(Arc::new(Mask(0x5a)))
        .with_send_plugin(Arc::new(Mask(0x5a)));
    let (_server, addr) = spawn_tcp_server(echo_router(), server_config).await;

    let client_config = ClientConfig::new()
        .with_send_plugin(Arc::new(Mask(0x5a)))
        .with_receive_plugin(Arc::new(Mask(0x5a)));
    let client = connect(addr, client_config).await;

    let (callbacks, mut rx) = outcome_callbacks();
    client
        .sync_call("echo", json!({"masked": true}), callbacks)
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"masked": true}));
    client.close();
}

#[tokio::test]
async fn test_heartbeat_reaches_ping_hook() {
    let (tx, mut rx) = mpsc::channel(16);
    let config = ServerConfig::new().with_on_ping(move |_ctx| {
        let _ = tx.try_send(());
    });
    let (_server, addr) = spawn_tcp_server(Router::new(), config).await;
    let client = connect(addr, ClientConfig::new()).await;

    client
        .start_heartbeat(Duration::from_millis(100), json!({}))
        .await
        .unwrap();

    // Immediate beat plus at least one tick.
    tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("first heartbeat within 200ms")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("periodic heartbeat")
        .unwrap();

    assert!(client.is_connected());
    client.stop_heartbeat();
    client.close();
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let (_server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut preamble = Vec::new();
    preamble.extend_from_slice(&2000u32.to_be_bytes());
    preamble.extend_from_slice(&1i64.to_be_bytes());
    preamble.extend_from_slice(&0u32.to_be_bytes());
    preamble.extend_from_slice(&MAX_PAYLOAD.to_be_bytes());
    stream.write_all(&preamble).await.unwrap();

    // The server rejects the declared frame and closes; no reply bytes.
    let mut buf = [0u8; 64];
    let closed = match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close the connection")
    {
        Ok(n) => n == 0,
        Err(_) => true,
    };
    assert!(closed);
}

#[tokio::test]
async fn test_route_miss_keeps_connection_alive() {
    let (_server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;
    let client = connect(addr, ClientConfig::new()).await;

    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("nope", json!({}), callbacks).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap().unwrap_err(),
        (500, "server don't register your request.".to_string())
    );

    // The connection survives the miss.
    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("echo", json!({"ok": true}), callbacks).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"ok": true}));
    client.close();
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let mut router = echo_router();
    router
        .bind("boom", |_ctx| {
            panic!("x");
        })
        .unwrap();
    let (_server, addr) = spawn_tcp_server(router, ServerConfig::new()).await;
    let client = connect(addr, ClientConfig::new()).await;

    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("boom", json!({}), callbacks).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap_err(), (500, "x".to_string()));

    // The same connection still serves requests.
    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("echo", json!({"y": 2}), callbacks).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"y": 2}));
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_sync_calls_each_get_one_terminal_callback() {
    let (_server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;
    let client = Arc::new(connect(addr, ClientConfig::new()).await);

    let mut calls = Vec::new();
    let mut counters = Vec::new();
    for i in 0..8 {
        let terminal = Arc::new(AtomicUsize::new(0));
        counters.push(terminal.clone());

        let client = client.clone();
        let success_count = terminal.clone();
        calls.push(tokio::spawn(async move {
            let callbacks = RequestStatusCallback::new()
                .on_success(move |_reply| {
                    success_count.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_code, _message| {
                    terminal.fetch_add(1, Ordering::SeqCst);
                });
            client.sync_call("echo", json!({ "i": i }), callbacks).await
        }));
    }

    for call in calls {
        call.await.unwrap().unwrap();
    }
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
    // Correlation table is empty at quiescence.
    assert_eq!(client.pending_count(), 0);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_call_timeout() {
    let mut router = Router::new();
    router
        .bind("slow", |_ctx| {
            std::thread::sleep(Duration::from_millis(400));
        })
        .unwrap();
    let (_server, addr) = spawn_tcp_server(router, ServerConfig::new()).await;

    let client = connect(
        addr,
        ClientConfig::new().with_timeout(Duration::from_millis(50)),
    )
    .await;

    let (callbacks, mut rx) = outcome_callbacks();
    let result = client.sync_call("slow", json!({}), callbacks).await;
    assert!(matches!(result, Err(corelink_client::ClientError::Timeout)));
    assert_eq!(
        rx.recv().await.unwrap().unwrap_err(),
        (408, "request timeout".to_string())
    );
    assert_eq!(client.pending_count(), 0);
    client.close();
}

#[tokio::test]
async fn test_close_hook_runs_exactly_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    let config = ServerConfig::new().with_on_close(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (_server, addr) = spawn_tcp_server(echo_router(), config).await;

    let client = connect(addr, ClientConfig::new()).await;
    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("echo", json!({}), callbacks).await.unwrap();
    rx.recv().await.unwrap().unwrap();
    client.close();

    for _ in 0..100 {
        if closes.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_after_server_restart() {
    let (server, addr) = spawn_tcp_server(echo_router(), ServerConfig::new()).await;
    let client = connect(
        addr,
        ClientConfig::new().with_retry_interval(Duration::from_millis(100)),
    )
    .await;

    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("echo", json!({"a": 1}), callbacks).await.unwrap();
    rx.recv().await.unwrap().unwrap();

    // Kill the server; the client drops to disconnected.
    server.shutdown();
    for _ in 0..100 {
        if !client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!client.is_connected());
    assert!(client
        .sync_call("echo", json!({}), RequestStatusCallback::new())
        .await
        .is_err());

    // Restart on the same port; the client recovers on its own.
    let listener = TcpListener::bind(addr).await.unwrap();
    let restarted = Arc::new(Server::new(ServerConfig::new(), echo_router()));
    let background = restarted.clone();
    tokio::spawn(async move {
        let _ = background.run_tcp_listener(listener).await;
    });

    for _ in 0..100 {
        if client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(client.is_connected());

    let (callbacks, mut rx) = outcome_callbacks();
    client.sync_call("echo", json!({"b": 2}), callbacks).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"b": 2}));
    client.close();
}

#[tokio::test]
async fn test_server_initiated_message_reaches_listener() {
    let mut router = Router::new();
    router
        .bind("trigger", |ctx| {
            ctx.write("push/event", json!({"n": 7})).unwrap();
            ctx.success(Value::Null).unwrap();
        })
        .unwrap();
    let (_server, addr) = spawn_tcp_server(router, ServerConfig::new()).await;
    let client = connect(addr, ClientConfig::new()).await;

    let (tx, mut rx) = mpsc::channel(1);
    client.add_message_listener("push/event", move |reply| {
        assert_eq!(reply.sequence, 0);
        let _ = tx.try_send(reply.parse::<Value>().unwrap());
    });

    client
        .sync_call("trigger", json!({}), RequestStatusCallback::new())
        .await
        .unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push within 2s")
        .unwrap();
    assert_eq!(pushed, json!({"n": 7}));

    client.remove_message_listener("push/event");
    client.close();
}

#[tokio::test]
async fn test_publish_subscribe_across_connections() {
    let mut router = Router::new();
    router
        .bind("subscribe/news", |ctx| {
            let push_ctx = ctx.clone();
            ctx.subscribe(
                "news",
                Arc::new(move |message| {
                    if let Ok(value) = serde_json::from_slice::<Value>(&message) {
                        let _ = push_ctx.write("push/news", value);
                    }
                }),
            )
            .unwrap();
            ctx.success(Value::Null).unwrap();
        })
        .unwrap();
    router
        .bind("publish/news", |ctx| {
            let body: Value = ctx.parse_param().unwrap();
            ctx.publish("news", body).unwrap();
            ctx.success(Value::Null).unwrap();
        })
        .unwrap();

    let config = ServerConfig::new().with_broker(MemoryBroker::new());
    let (_server, addr) = spawn_tcp_server(router, config).await;

    let subscriber = connect(addr, ClientConfig::new()).await;
    let (tx, mut rx) = mpsc::channel(1);
    subscriber.add_message_listener("push/news", move |reply| {
        let _ = tx.try_send(reply.parse::<Value>().unwrap());
    });
    subscriber
        .sync_call("subscribe/news", json!({}), RequestStatusCallback::new())
        .await
        .unwrap();

    let publisher = connect(addr, ClientConfig::new()).await;
    publisher
        .sync_call("publish/news", json!({"headline": "hi"}), RequestStatusCallback::new())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("broker delivery within 2s")
        .unwrap();
    assert_eq!(received, json!({"headline": "hi"}));

    publisher.close();
    subscriber.close();
}

#[tokio::test]
async fn test_udp_echo() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(), echo_router()));
    let background = server.clone();
    tokio::spawn(async move {
        let _ = background.run_udp_socket(socket).await;
    });

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Packet::new(
        operator_code("echo"),
        31,
        bytes::Bytes::new(),
        bytes::Bytes::from_static(b"{\"u\":1}"),
    );
    peer.send_to(&request.encode(), addr).await.unwrap();

    let mut buf = vec![0u8; MAX_PAYLOAD as usize];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("udp reply within 2s")
        .unwrap();

    let reply = Packet::from_datagram(&buf[..n], MAX_PAYLOAD).unwrap();
    assert_eq!(reply.operator, operator_code("echo"));
    assert_eq!(reply.sequence, 31);
    assert_eq!(reply.body, bytes::Bytes::from_static(b"{\"u\":1}"));
}

#[tokio::test]
async fn test_websocket_echo_and_path_check() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(), echo_router()));
    let background = server.clone();
    tokio::spawn(async move {
        let _ = background.run_websocket_listener(listener).await;
    });

    // Wrong path is rejected during the upgrade.
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere"))
            .await
            .is_err()
    );

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
        .await
        .unwrap();

    let request = Packet::new(
        operator_code("echo"),
        77,
        HeaderMap::new().encode(),
        bytes::Bytes::from_static(b"{\"w\":1}"),
    );
    ws.send(Message::Binary(request.encode().to_vec()))
        .await
        .unwrap();

    let reply = loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("websocket reply within 2s")
            .unwrap()
            .unwrap()
        {
            Message::Binary(data) => {
                let mut decoder = FrameDecoder::new();
                decoder.extend(&data);
                break decoder.decode(MAX_PAYLOAD).unwrap().unwrap();
            }
            _ => continue,
        }
    };

    assert_eq!(reply.sequence, 77);
    assert_eq!(reply.body, bytes::Bytes::from_static(b"{\"w\":1}"));
    let _ = ws.close(None).await;
}
