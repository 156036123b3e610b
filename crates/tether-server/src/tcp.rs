//! Object-facing TCP listener.

use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Router, Session, SessionConfig, SessionError};
use tether_transport::{BoxedIo, TlsUpgrade};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept connections and run one session task per peer until cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_tcp_server(
    addr: SocketAddr,
    router: Arc<Router>,
    tls: Option<Arc<dyn TlsUpgrade>>,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
    info!("TCP listener on {}", addr);

    let session_config = SessionConfig {
        request_timeout,
        ..SessionConfig::default()
    };

    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, "connection accepted");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }
        let io: BoxedIo = Box::new(stream);
        let session = Session::new(Arc::clone(&router), tls.clone(), session_config);
        tokio::spawn(async move {
            let _guard = ConnectionMetricsGuard::new();
            match session.run(io).await {
                Ok(()) => {}
                Err(SessionError::AuthFailed) => metrics::record_auth_failure(),
                Err(_) => metrics::record_error("session"),
            }
        });
    }
    Ok(())
}
