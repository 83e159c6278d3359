//! WebSocket transport.
//!
//! One binary message carries exactly one framed packet. The upgrade is
//! accepted at the configured path (plus a `<path>/websocket` legacy
//! alias) with a permissive origin policy, then packets flow through the
//! same dispatch pipeline as TCP.

use crate::context::{Context, QueueSink, ReplySink, NODE_ID_KEY};
use crate::dispatch::dispatch;
use crate::error::ServerError;
use crate::server::ServerShared;
use crate::tcp::{INBOUND_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY};
use bytes::Bytes;
use corelink_protocol::Packet;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

pub(crate) async fn serve(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                        shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                        tracing::info!("websocket client connected: {}", addr);

                        let shared = shared.clone();
                        let conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            match handle_connection(shared.clone(), stream, addr, conn_shutdown).await {
                                Ok(()) => tracing::info!("websocket client disconnected: {}", addr),
                                Err(e) => {
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!("[{}] websocket connection error: {}", addr, e);
                                }
                            }
                            shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("websocket listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let config = shared.config.clone();
    let local = stream.local_addr().ok();

    let path = config.websocket_path.clone();
    let legacy = format!("{}/websocket", path.trim_end_matches('/'));
    let callback = move |request: &Request, response: Response| {
        let got = request.uri().path();
        // check_origin stays permissive; only the path is enforced.
        if got == path || got == legacy {
            Ok(response)
        } else {
            let mut reject = ErrorResponse::new(Some("unknown websocket path".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_payload as usize);
    ws_config.max_frame_size = Some(config.max_payload as usize);
    let ws =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (mut ws_tx, ws_rx) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);
    let (closed_tx, mut closed_rx) = watch::channel(false);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(frame) => {
                        if ws_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = closed_rx.changed() => {
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if ws_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    let _ = ws_tx.close().await;
                    return;
                }
            }
        }
    });

    let sink: Arc<dyn ReplySink> = Arc::new(QueueSink {
        tx: outbound_tx,
        local,
        remote: Some(addr),
    });
    let node_id = Uuid::new_v4().to_string();

    if let Some(hook) = &config.on_open {
        let mut ctx = Context::bare(sink.clone(), config.clone());
        ctx.set(NODE_ID_KEY, &node_id);
        hook(&mut ctx);
    }

    let (packet_tx, mut packet_rx) = mpsc::channel::<Packet>(INBOUND_QUEUE_CAPACITY);
    let dispatcher = {
        let shared = shared.clone();
        let sink = sink.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                tokio::spawn(dispatch(
                    shared.clone(),
                    sink.clone(),
                    packet,
                    Some(node_id.clone()),
                ));
            }
        })
    };

    let result = read_loop(&shared, ws_rx, packet_tx, &mut shutdown).await;

    if let Some(hook) = &config.on_close {
        let mut ctx = Context::bare(sink.clone(), config.clone());
        ctx.set(NODE_ID_KEY, &node_id);
        hook(&mut ctx);
    }
    if let Some(broker) = &config.broker {
        if let Err(e) = broker.unsubscribe_all(&node_id) {
            tracing::debug!("[{}] broker cleanup failed: {}", addr, e);
        }
    }

    let _ = closed_tx.send(true);
    let _ = writer.await;
    let _ = dispatcher.await;

    result
}

async fn read_loop(
    shared: &Arc<ServerShared>,
    mut ws_rx: SplitStream<WebSocketStream<TcpStream>>,
    packet_tx: mpsc::Sender<Packet>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let config = &shared.config;

    loop {
        let message = tokio::select! {
            message = next_with_deadline(&mut ws_rx, config.timeout) => message?,
            _ = shutdown.recv() => return Ok(()),
        };

        match message {
            Some(Message::Binary(data)) => {
                let packet = Packet::from_datagram(&data, config.max_payload)?;
                if packet_tx.send(packet).await.is_err() {
                    return Ok(());
                }
            }
            Some(Message::Close(_)) | None => return Ok(()),
            Some(other) => {
                tracing::debug!("ignoring non-binary websocket message: {:?}", other);
            }
        }
    }
}

async fn next_with_deadline(
    ws_rx: &mut SplitStream<WebSocketStream<TcpStream>>,
    deadline: Duration,
) -> Result<Option<Message>, ServerError> {
    let next = async {
        match ws_rx.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(ServerError::WebSocket(e)),
            None => Ok(None),
        }
    };

    if deadline.is_zero() {
        return next.await;
    }
    match tokio::time::timeout(deadline, next).await {
        Ok(result) => result,
        Err(_) => Err(ServerError::ReadTimeout),
    }
}
