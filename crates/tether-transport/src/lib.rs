//! # tether-transport
//!
//! Byte-stream transport seam for the Tether broker.
//!
//! The broker core never touches sockets directly: it drives a [`BoxedIo`]
//! and asks an optional [`TlsUpgrade`] implementation to start TLS when a
//! peer negotiates it. This crate provides the trait definitions, the
//! rustls-backed upgrader used in production, and an in-memory pipe used by
//! tests.

pub mod memory;
pub mod tls;
pub mod traits;

pub use tls::RustlsUpgrade;
pub use traits::{BoxedIo, Io, TlsUpgrade, TransportError};
