//! Transport abstraction for Tether connections.
//!
//! The session state machine only needs "send bytes", "receive exactly N
//! bytes", "start TLS" and closure notification from its transport. These
//! traits erase the concrete stream type so the same state machine runs over
//! plain TCP, TLS, or an in-memory pipe in tests.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe byte stream.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A boxed byte stream a session drives directly.
pub type BoxedIo = Box<dyn Io>;

/// Transport-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS certificate or key material could not be loaded.
    #[error("TLS material error: {0}")]
    TlsMaterial(String),
}

/// Server-side TLS upgrade capability.
///
/// A session holds an `Option<Arc<dyn TlsUpgrade>>`; `None` means TLS is
/// unavailable and initiation requests asking for it are rejected.
#[async_trait]
pub trait TlsUpgrade: Send + Sync {
    /// Perform the server-side TLS handshake over an accepted stream.
    async fn upgrade(&self, io: BoxedIo) -> io::Result<BoxedIo>;
}
