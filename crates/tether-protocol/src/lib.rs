//! # tether-protocol
//!
//! Wire protocol definitions for the Tether object/central broker.
//!
//! This crate defines the hand-rolled big-endian binary protocol spoken
//! between object devices, the broker, and the central peer: identities,
//! handshake structures, data-transmission frames, the UDP telemetry
//! datagram, and payload format conversions.
//!
//! ## Frame kinds
//!
//! - Initiation request/response - version and TLS negotiation
//! - Challenge / challenge response - HMAC-SHA-256 authentication
//! - `Acl` - central pushes the full access table
//! - `Ping` / `Pong` - keepalive
//! - `Request` / `Response` - correlated exchange by tracking number
//! - `TelemetryToken` - capability token for UDP telemetry
//! - `IdentTelemetry` - telemetry forwarded to central
//! - `CloseConnection` - coded close
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Uid};
//!
//! let uid = Uid::from_name("ObjTest").unwrap();
//! let frame = codec::make_request(Some(&uid), 30303, 0x00, 0x00, b"BONJOUR").unwrap();
//! let (tot, routed) = codec::decode_transmission_header(frame[0]).unwrap();
//! assert_eq!(tot, codec::TransmissionType::Request);
//! assert!(routed);
//! ```

pub mod codec;
pub mod identity;
pub mod payload;

pub use codec::{close_code, response_code, CodecError, TransmissionType, PROTOCOL_VERSION};
pub use identity::{token_to_hex, AuthKey, GroupId, TelemetryToken, Uid};
pub use payload::{PayloadFormat, PayloadValue, FORMAT_OPT_NONE};
