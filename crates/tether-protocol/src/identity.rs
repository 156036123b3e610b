//! 16-byte identities for devices and groups.
//!
//! An identity is a UTF-8 name right-aligned in 16 bytes and left-padded
//! with zero bytes. The all-zero value is reserved for the central peer.

use crate::codec::CodecError;
use std::fmt;

/// Byte width of an encoded identity.
pub const IDENT_LEN: usize = 16;

fn name_to_bin128(name: &str) -> Result<[u8; IDENT_LEN], CodecError> {
    let bytes = name.as_bytes();
    if bytes.len() > IDENT_LEN {
        return Err(CodecError::NameTooLong(name.len()));
    }
    let mut out = [0u8; IDENT_LEN];
    out[IDENT_LEN - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

fn name_from_bin128(bin: &[u8; IDENT_LEN]) -> Result<String, CodecError> {
    let start = bin.iter().position(|&b| b != 0).unwrap_or(IDENT_LEN);
    std::str::from_utf8(&bin[start..])
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Device identity on the wire.
///
/// `Uid::CENTRAL` (all zeroes) addresses the privileged central peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid([u8; IDENT_LEN]);

impl Uid {
    /// The reserved central identity.
    pub const CENTRAL: Uid = Uid([0u8; IDENT_LEN]);

    /// Encode a device name into an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the UTF-8 encoding of the name exceeds 16 bytes.
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        Ok(Self(name_to_bin128(name)?))
    }

    /// Wrap raw wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; IDENT_LEN]) -> Self {
        Self(bytes)
    }

    /// The decoded device name (empty for the central identity).
    ///
    /// # Errors
    ///
    /// Returns an error if the stripped bytes are not valid UTF-8.
    pub fn name(&self) -> Result<String, CodecError> {
        name_from_bin128(&self.0)
    }

    /// The raw 16 wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDENT_LEN] {
        &self.0
    }

    /// Whether this is the reserved central identity.
    #[must_use]
    pub fn is_central(&self) -> bool {
        *self == Self::CENTRAL
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_central() {
            return write!(f, "<central>");
        }
        match self.name() {
            Ok(name) => write!(f, "{name}"),
            Err(_) => {
                for b in self.0 {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
        }
    }
}

/// Group identity, encoded with the same scheme as [`Uid`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId([u8; IDENT_LEN]);

impl GroupId {
    /// Encode a group name into an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the UTF-8 encoding of the name exceeds 16 bytes.
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        Ok(Self(name_to_bin128(name)?))
    }

    /// Wrap raw wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; IDENT_LEN]) -> Self {
        Self(bytes)
    }

    /// The decoded group name.
    ///
    /// # Errors
    ///
    /// Returns an error if the stripped bytes are not valid UTF-8.
    pub fn name(&self) -> Result<String, CodecError> {
        name_from_bin128(&self.0)
    }

    /// The raw 16 wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDENT_LEN] {
        &self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Ok(name) => write!(f, "GroupId({name})"),
            Err(_) => write!(f, "GroupId(<invalid>)"),
        }
    }
}

/// A 16-byte pre-shared authentication key.
pub type AuthKey = [u8; 16];

/// An 8-byte telemetry capability token.
pub type TelemetryToken = [u8; 8];

/// Render a telemetry token as uppercase hex for logs.
#[must_use]
pub fn token_to_hex(token: &TelemetryToken) -> String {
    token.iter().map(|b| format!("{b:02X}")).collect()
}
