//! TCP transport.
//!
//! One read task per connection feeds a bounded packet queue; a dispatcher
//! task fans each packet out to its own handler task; replies funnel
//! through a single writer task per connection, so concurrent handlers
//! never interleave on the socket.

use crate::context::{Context, QueueSink, ReplySink, NODE_ID_KEY};
use crate::dispatch::dispatch;
use crate::error::ServerError;
use crate::server::ServerShared;
use bytes::Bytes;
use corelink_protocol::{FrameDecoder, Packet, ProtocolError};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

/// Capacity of the inbound packet queue between reader and dispatcher.
pub(crate) const INBOUND_QUEUE_CAPACITY: usize = 100;

/// Capacity of the per-connection outbound reply queue.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 128;

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
                        tracing::info!("client connected: {}", addr);

                        let shared = shared.clone();
                        let conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            match handle_connection(shared.clone(), stream, addr, conn_shutdown).await {
                                Ok(()) => tracing::info!("client disconnected: {}", addr),
                                Err(e) => {
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!("[{}] connection error: {}", addr, e);
                                }
                            }
                            shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("tcp listener shutting down");
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
    stream.set_nodelay(true).ok();
    let config = shared.config.clone();
    let local = stream.local_addr().ok();
    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);
    let (closed_tx, closed_rx) = watch::channel(false);
    let writer = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        closed_rx,
        config.write_buffer_size,
    ));

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

    // Reader → bounded queue → dispatcher fan-out. A full queue blocks the
    // reader, which in turn applies TCP backpressure.
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

    let result = read_loop(&shared, read_half, packet_tx, &mut shutdown).await;

    // Teardown runs exactly once per connection, for any exit path.
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
    mut reader: OwnedReadHalf,
    packet_tx: mpsc::Sender<Packet>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let config = &shared.config;
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; config.read_buffer_size];

    loop {
        let n = tokio::select! {
            result = read_with_deadline(&mut reader, &mut buf, config.timeout) => result?,
            _ = shutdown.recv() => return Ok(()),
        };

        if n == 0 {
            // EOF at a frame boundary is a normal close; mid-frame it is not.
            if decoder.buffered() == 0 {
                return Ok(());
            }
            return Err(ProtocolError::ShortRead {
                needed: decoder.buffered(),
            }
            .into());
        }
        decoder.extend(&buf[..n]);

        while let Some(packet) = decoder.decode(config.max_payload)? {
            if packet_tx.send(packet).await.is_err() {
                return Ok(());
            }
        }
    }
}

async fn read_with_deadline<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<usize, ServerError> {
    if deadline.is_zero() {
        return Ok(reader.read(buf).await?);
    }
    match tokio::time::timeout(deadline, reader.read(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ServerError::ReadTimeout),
    }
}

/// Drains the outbound queue onto the socket, one whole frame per write.
/// On close the already-queued frames are flushed best-effort; frames sent
/// afterwards are discarded by the sink.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut writer = BufWriter::with_capacity(buffer_size, writer);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                    if writer.flush().await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = closed.changed() => {
                while let Ok(frame) = rx.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                let _ = writer.flush().await;
                return;
            }
        }
    }
}
