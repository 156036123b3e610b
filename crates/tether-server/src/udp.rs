//! Telemetry UDP listener.
//!
//! Datagrams carry a token, a payload header and the data; anything that
//! fails to decode or names an unknown token is dropped without reply.

use crate::metrics;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::Router;
use tether_protocol::codec;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receive telemetry datagrams until cancelled.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn run_udp_server(
    addr: SocketAddr,
    datagram_max_size: usize,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
    info!("UDP telemetry listener on {}", addr);

    let mut buf = vec![0u8; datagram_max_size];
    loop {
        let (len, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "telemetry receive failed");
                    continue;
                }
            },
        };

        let accepted = match codec::decode_telemetry_packet(&buf[..len]) {
            Ok(packet) => router
                .route_telemetry(&packet.token, packet.format, packet.format_opt, &packet.data)
                .is_ok(),
            Err(e) => {
                debug!(%peer, error = %e, "malformed telemetry datagram");
                false
            }
        };
        metrics::record_telemetry(accepted);
    }
    Ok(())
}
