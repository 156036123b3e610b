//! In-memory transport for tests.
//!
//! Provides both ends of a duplex pipe as [`BoxedIo`], so session logic can
//! be exercised end to end without sockets.

use crate::traits::BoxedIo;

/// Create a connected pair of in-memory streams.
///
/// The first element plays the broker side, the second the peer side.
#[must_use]
pub fn pair(capacity: usize) -> (BoxedIo, BoxedIo) {
    let (server, client) = tokio::io::duplex(capacity);
    (Box::new(server), Box::new(client))
}
