//! Binary codec for every Tether wire structure.
//!
//! All layouts are big-endian and bit-exact. Encoding and decoding are pure
//! transformations: a decode either fully succeeds or returns a
//! [`CodecError`], never a partial result.

use crate::identity::{AuthKey, GroupId, TelemetryToken, Uid, IDENT_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version negotiated during initiation.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Initiation response rule: no redirection rule attached.
pub const INIT_NO_RULE: u8 = 0x00;

/// Size of the challenge nonce sent by the broker.
pub const NONCE_LEN: usize = 16;

/// Size of the client reply to a challenge: UID + HMAC-SHA-256.
pub const CHALLENGE_RESPONSE_LEN: usize = IDENT_LEN + 32;

/// Size of one encoded ACL item: GroupID + UID + AuthKey.
pub const ACL_ITEM_LEN: usize = 48;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not enough bytes for the structure being decoded.
    #[error("truncated frame: need at least {0} bytes")]
    Truncated(usize),

    /// Identity name exceeds 16 UTF-8 bytes.
    #[error("identity name too long ({0} chars)")]
    NameTooLong(usize),

    /// Invalid UTF-8 in an identity or payload.
    #[error("invalid UTF-8 data")]
    InvalidUtf8,

    /// Transmission type nibble is not defined by the protocol.
    #[error("unknown transmission type 0x{0:X}")]
    UnknownTransmission(u8),

    /// Payload format nibble is not defined by the protocol.
    #[error("unknown payload format 0x{0:X}")]
    UnknownFormat(u8),

    /// HTTP envelope format name is not defined by the protocol.
    #[error("unknown payload format name: {0}")]
    UnknownFormatName(String),

    /// ASCII payload contains non-ASCII bytes.
    #[error("payload is not ASCII")]
    NotAscii,

    /// JSON payload cannot be parsed or serialized.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    /// HTTP envelope payload shape does not match its declared format.
    #[error("JSON payload shape does not match format")]
    BadJsonPayload,

    /// Datagram length differs from the header-declared content length.
    #[error("length does not match declared content length")]
    LengthMismatch,

    /// Payload exceeds the 16-bit content length field.
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
}

/// Response result codes carried in Response frames.
///
/// Codes above 0x9F are reserved for broker-synthesized errors; everything
/// else is passed through between peers untouched.
pub mod response_code {
    pub const OK: u8 = 0x00;
    pub const REJECTED: u8 = 0x01;
    pub const NO_DESTINATION: u8 = 0xA0;
    pub const TIMEOUT: u8 = 0xA1;
    pub const DUPLICATE_TRACKING: u8 = 0xA2;
}

/// Close codes carried in CloseConnection frames.
pub mod close_code {
    pub const PROTOCOL_ERROR: u8 = 0x00;
    pub const PLANNED_SHUTDOWN: u8 = 0x01;
    pub const MAX_LOAD: u8 = 0x02;
    pub const PROCESS_ERROR: u8 = 0x03;
    /// Peer is entering sleep mode and intends to reconnect.
    pub const SLEEP_MODE: u8 = 0xA0;
    /// Peer is flushing resources and intends to reconnect.
    pub const FLUSH_RESOURCES: u8 = 0xA1;
}

/// Transmission type tag (high nibble of a data-transmission header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransmissionType {
    Acl = 0x0,
    Ping = 0x1,
    Pong = 0x2,
    Request = 0x3,
    Response = 0x4,
    TelemetryToken = 0x5,
    /// Telemetry forwarded to central, tagged with the source identity.
    IdentTelemetry = 0x6,
    CloseConnection = 0xF,
}

impl TryFrom<u8> for TransmissionType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(TransmissionType::Acl),
            0x1 => Ok(TransmissionType::Ping),
            0x2 => Ok(TransmissionType::Pong),
            0x3 => Ok(TransmissionType::Request),
            0x4 => Ok(TransmissionType::Response),
            0x5 => Ok(TransmissionType::TelemetryToken),
            0x6 => Ok(TransmissionType::IdentTelemetry),
            0xF => Ok(TransmissionType::CloseConnection),
            other => Err(CodecError::UnknownTransmission(other)),
        }
    }
}

/// Initiation request: first 4 bytes sent by a connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiationRequest {
    /// Peer asks to upgrade the connection to TLS.
    pub tls: bool,
    /// Requested protocol version (7 bits).
    pub version: u8,
    /// Option flags (currently unused, passed through).
    pub options: u8,
    /// Maximum transmission length the peer accepts.
    pub max_transmission_len: u16,
}

impl InitiationRequest {
    /// Encoded size in bytes.
    pub const LEN: usize = 4;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let len = self.max_transmission_len.to_be_bytes();
        [
            (u8::from(self.tls) << 7) | (self.version & 0x7F),
            self.options,
            len[0],
            len[1],
        ]
    }

    /// Decode from exactly 4 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 4 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LEN {
            return Err(CodecError::Truncated(Self::LEN));
        }
        Ok(Self {
            tls: data[0] >> 7 != 0,
            version: data[0] & 0x7F,
            options: data[1],
            max_transmission_len: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// Initiation response sent by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiationResponse {
    /// Connection accepted.
    pub accepted: bool,
    /// Rule type (7 bits); only [`INIT_NO_RULE`] is emitted.
    pub rule_type: u8,
    /// Rule flags.
    pub rule_flags: u8,
}

impl InitiationResponse {
    /// Encoded size in bytes (without rule payload).
    pub const LEN: usize = 2;

    #[must_use]
    pub fn new(accepted: bool) -> Self {
        Self {
            accepted,
            rule_type: INIT_NO_RULE,
            rule_flags: 0x00,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        [
            (u8::from(self.accepted) << 7) | (self.rule_type & 0x7F),
            self.rule_flags,
        ]
    }

    /// Decode from at least 2 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 2 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LEN {
            return Err(CodecError::Truncated(Self::LEN));
        }
        Ok(Self {
            accepted: data[0] >> 7 != 0,
            rule_type: data[0] & 0x7F,
            rule_flags: data[1],
        })
    }
}

/// Encode the single-byte authentication validation.
#[must_use]
pub fn make_auth_validation(validated: bool) -> [u8; 1] {
    [u8::from(validated)]
}

/// Decode the single-byte authentication validation.
///
/// # Errors
///
/// Returns an error unless exactly one byte is provided.
pub fn decode_auth_validation(data: &[u8]) -> Result<bool, CodecError> {
    if data.len() != 1 {
        return Err(CodecError::Truncated(1));
    }
    Ok(data[0] != 0)
}

/// Decode a 48-byte challenge response into UID and HMAC.
///
/// # Errors
///
/// Returns an error unless exactly 48 bytes are provided.
pub fn decode_challenge_response(data: &[u8]) -> Result<(Uid, [u8; 32]), CodecError> {
    if data.len() != CHALLENGE_RESPONSE_LEN {
        return Err(CodecError::Truncated(CHALLENGE_RESPONSE_LEN));
    }
    let mut uid = [0u8; IDENT_LEN];
    uid.copy_from_slice(&data[..IDENT_LEN]);
    let mut hmac = [0u8; 32];
    hmac.copy_from_slice(&data[IDENT_LEN..]);
    Ok((Uid::from_bytes(uid), hmac))
}

/// Encode a challenge response (client side / tests).
#[must_use]
pub fn make_challenge_response(uid: &Uid, hmac: &[u8; 32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHALLENGE_RESPONSE_LEN);
    buf.put_slice(uid.as_bytes());
    buf.put_slice(hmac);
    buf.freeze()
}

/// One ACL entry as carried in an ACL push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclItem {
    pub group: GroupId,
    pub uid: Uid,
    pub key: AuthKey,
}

impl AclItem {
    #[must_use]
    pub fn encode(&self) -> [u8; ACL_ITEM_LEN] {
        let mut out = [0u8; ACL_ITEM_LEN];
        out[..16].copy_from_slice(self.group.as_bytes());
        out[16..32].copy_from_slice(self.uid.as_bytes());
        out[32..].copy_from_slice(&self.key);
        out
    }

    /// Decode from exactly 48 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly 48 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != ACL_ITEM_LEN {
            return Err(CodecError::Truncated(ACL_ITEM_LEN));
        }
        let mut group = [0u8; 16];
        group.copy_from_slice(&data[..16]);
        let mut uid = [0u8; 16];
        uid.copy_from_slice(&data[16..32]);
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[32..]);
        Ok(Self {
            group: GroupId::from_bytes(group),
            uid: Uid::from_bytes(uid),
            key,
        })
    }
}

/// Payload header: format nibble, option nibble, 16-bit content length.
///
/// The format is kept as a raw nibble here because routed frames are passed
/// through untouched even when the broker does not understand the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub format: u8,
    pub format_opt: u8,
    pub len: u16,
}

impl PayloadHeader {
    /// Encoded size in bytes.
    pub const LEN: usize = 3;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let len = self.len.to_be_bytes();
        [
            ((self.format & 0x0F) << 4) | (self.format_opt & 0x0F),
            len[0],
            len[1],
        ]
    }

    /// Decode from exactly 3 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 3 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LEN {
            return Err(CodecError::Truncated(Self::LEN));
        }
        Ok(Self {
            format: data[0] >> 4,
            format_opt: data[0] & 0x0F,
            len: u16::from_be_bytes([data[1], data[2]]),
        })
    }
}

/// Request sub-header: tracking number + payload header (5 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub tracking: u16,
    pub payload: PayloadHeader,
}

impl RequestHeader {
    /// Encoded size in bytes.
    pub const LEN: usize = 5;

    /// Decode from exactly 5 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 5 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LEN {
            return Err(CodecError::Truncated(Self::LEN));
        }
        Ok(Self {
            tracking: u16::from_be_bytes([data[0], data[1]]),
            payload: PayloadHeader::decode(&data[2..])?,
        })
    }
}

/// Response sub-header: tracking number + result code + payload header (6 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub tracking: u16,
    pub code: u8,
    pub payload: PayloadHeader,
}

impl ResponseHeader {
    /// Encoded size in bytes.
    pub const LEN: usize = 6;

    /// Decode from exactly 6 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 6 bytes are provided.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LEN {
            return Err(CodecError::Truncated(Self::LEN));
        }
        Ok(Self {
            tracking: u16::from_be_bytes([data[0], data[1]]),
            code: data[2],
            payload: PayloadHeader::decode(&data[3..])?,
        })
    }
}

fn transmission_header(tot: TransmissionType, uid: Option<&Uid>) -> BytesMut {
    let routed = uid.is_some();
    let mut buf = BytesMut::with_capacity(1 + if routed { IDENT_LEN } else { 0 });
    buf.put_u8(((tot as u8) << 4) | (u8::from(routed) << 3));
    if let Some(uid) = uid {
        buf.put_slice(uid.as_bytes());
    }
    buf
}

/// Decode a data-transmission header byte into (type, routed flag).
///
/// # Errors
///
/// Returns an error for an unknown transmission type.
pub fn decode_transmission_header(byte: u8) -> Result<(TransmissionType, bool), CodecError> {
    let tot = TransmissionType::try_from(byte >> 4)?;
    let routed = byte & 0x08 != 0;
    Ok((tot, routed))
}

/// Encode an ACL push header with the item count that follows.
#[must_use]
pub fn make_acl_header(item_count: u32) -> Bytes {
    let mut buf = transmission_header(TransmissionType::Acl, None);
    buf.put_u32(item_count);
    buf.freeze()
}

/// Encode a Ping frame.
#[must_use]
pub fn make_ping() -> Bytes {
    transmission_header(TransmissionType::Ping, None).freeze()
}

/// Encode a Pong frame.
#[must_use]
pub fn make_pong() -> Bytes {
    transmission_header(TransmissionType::Pong, None).freeze()
}

/// Encode a TelemetryToken frame.
#[must_use]
pub fn make_telemetry_token(token: &TelemetryToken) -> Bytes {
    let mut buf = transmission_header(TransmissionType::TelemetryToken, None);
    buf.put_slice(token);
    buf.freeze()
}

/// Encode a full Request frame.
///
/// `uid` is the peer identity the frame is tagged with: the destination on
/// the object-to-broker leg, the source on the broker-to-destination leg,
/// `None` for the central peer.
///
/// # Errors
///
/// Returns an error if the payload exceeds the 16-bit length field.
pub fn make_request(
    uid: Option<&Uid>,
    tracking: u16,
    format: u8,
    format_opt: u8,
    data: &[u8],
) -> Result<Bytes, CodecError> {
    let len = payload_len(data)?;
    let mut buf = transmission_header(TransmissionType::Request, uid);
    buf.put_u16(tracking);
    buf.put_slice(&PayloadHeader { format, format_opt, len }.encode());
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Encode a full Response frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds the 16-bit length field.
pub fn make_response(
    uid: Option<&Uid>,
    tracking: u16,
    code: u8,
    format: u8,
    format_opt: u8,
    data: &[u8],
) -> Result<Bytes, CodecError> {
    let len = payload_len(data)?;
    let mut buf = transmission_header(TransmissionType::Response, uid);
    buf.put_u16(tracking);
    buf.put_u8(code);
    buf.put_slice(&PayloadHeader { format, format_opt, len }.encode());
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Encode an empty error Response frame.
#[must_use]
pub fn make_response_error(uid: Option<&Uid>, tracking: u16, code: u8) -> Bytes {
    // Empty payloads never exceed the length field.
    make_response(uid, tracking, code, 0x00, 0x00, &[]).unwrap_or_default()
}

/// Encode a CloseConnection frame.
#[must_use]
pub fn make_close(code: u8) -> Bytes {
    let mut buf = transmission_header(TransmissionType::CloseConnection, None);
    buf.put_u8(code);
    buf.freeze()
}

/// Encode an IdentTelemetry frame routed to the central peer.
///
/// # Errors
///
/// Returns an error if the payload exceeds the 16-bit length field.
pub fn make_ident_telemetry(
    uid: &Uid,
    format: u8,
    format_opt: u8,
    data: &[u8],
) -> Result<Bytes, CodecError> {
    let len = payload_len(data)?;
    let mut buf = transmission_header(TransmissionType::IdentTelemetry, Some(uid));
    buf.put_slice(&PayloadHeader { format, format_opt, len }.encode());
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// A decoded UDP telemetry datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPacket {
    pub token: TelemetryToken,
    pub format: u8,
    pub format_opt: u8,
    pub data: Vec<u8>,
}

/// Minimum size of a telemetry datagram: token + payload header.
pub const TELEMETRY_PACKET_MIN_LEN: usize = 8 + PayloadHeader::LEN;

/// Encode a UDP telemetry datagram (client side / tests).
///
/// # Errors
///
/// Returns an error if the payload exceeds the 16-bit length field.
pub fn make_telemetry_packet(
    token: &TelemetryToken,
    format: u8,
    format_opt: u8,
    data: &[u8],
) -> Result<Bytes, CodecError> {
    let len = payload_len(data)?;
    let mut buf = BytesMut::with_capacity(TELEMETRY_PACKET_MIN_LEN + data.len());
    buf.put_slice(token);
    buf.put_slice(&PayloadHeader { format, format_opt, len }.encode());
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Decode a UDP telemetry datagram.
///
/// The datagram length must exactly match the header-declared content
/// length; anything else is rejected.
///
/// # Errors
///
/// Returns an error for short datagrams or length mismatches.
pub fn decode_telemetry_packet(datagram: &[u8]) -> Result<TelemetryPacket, CodecError> {
    if datagram.len() < TELEMETRY_PACKET_MIN_LEN {
        return Err(CodecError::Truncated(TELEMETRY_PACKET_MIN_LEN));
    }
    let mut token = [0u8; 8];
    token.copy_from_slice(&datagram[..8]);
    let header = PayloadHeader::decode(&datagram[8..])?;
    if datagram.len() != TELEMETRY_PACKET_MIN_LEN + header.len as usize {
        return Err(CodecError::LengthMismatch);
    }
    Ok(TelemetryPacket {
        token,
        format: header.format,
        format_opt: header.format_opt,
        data: datagram[TELEMETRY_PACKET_MIN_LEN..].to_vec(),
    })
}

fn payload_len(data: &[u8]) -> Result<u16, CodecError> {
    u16::try_from(data.len()).map_err(|_| CodecError::PayloadTooLarge(data.len()))
}
