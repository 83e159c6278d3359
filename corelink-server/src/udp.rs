//! UDP transport.
//!
//! No connection state: one framed packet per datagram, one dispatch task
//! per datagram, replies sent back to the datagram's source address on the
//! listening socket. No deadlines, no reconnect. A datagram shorter than
//! its declared lengths is dropped.

use crate::context::{ReplySink, UdpSink};
use crate::dispatch::dispatch;
use crate::error::ServerError;
use crate::server::ServerShared;
use corelink_protocol::Packet;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

pub(crate) async fn serve(
    shared: Arc<ServerShared>,
    socket: UdpSocket,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let socket = Arc::new(socket);
    let config = shared.config.clone();
    let mut buf = vec![0u8; config.max_payload as usize];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = result?;

                // The read buffer is reused for the next datagram, so the
                // frame is copied out before the dispatch task owns it.
                let packet = match Packet::from_datagram(&buf[..n], config.max_payload) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!("dropping malformed datagram from {}: {}", peer, e);
                        continue;
                    }
                };

                let sink: Arc<dyn ReplySink> = Arc::new(UdpSink {
                    socket: socket.clone(),
                    peer,
                });
                tokio::spawn(dispatch(shared.clone(), sink, packet, None));
            }
            _ = shutdown.recv() => {
                tracing::info!("udp listener shutting down");
                return Ok(());
            }
        }
    }
}
