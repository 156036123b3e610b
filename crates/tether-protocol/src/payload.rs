//! Payload formats and conversions.
//!
//! Payloads travel as opaque bytes tagged with a 4-bit format. The broker
//! routes them untouched between sessions; conversions to and from JSON
//! values only happen at the HTTP bridge boundary.

use crate::codec::CodecError;
use serde_json::Value;

/// Payload data formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadFormat {
    /// Raw bytes; represented as an array of byte values in JSON.
    Binary = 0x00,
    /// ASCII text.
    Ascii = 0x01,
    /// UTF-8 text.
    Utf8 = 0x02,
    /// A JSON document encoded as UTF-8 text.
    Json = 0x0A,
}

/// The only defined format option.
pub const FORMAT_OPT_NONE: u8 = 0x00;

impl PayloadFormat {
    /// The name used in HTTP envelopes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Binary => "BINARY",
            PayloadFormat::Ascii => "ASCII",
            PayloadFormat::Utf8 => "UTF8",
            PayloadFormat::Json => "JSON",
        }
    }

    /// Parse an HTTP envelope format name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn from_str(name: &str) -> Result<Self, CodecError> {
        match name {
            "BINARY" => Ok(PayloadFormat::Binary),
            "ASCII" => Ok(PayloadFormat::Ascii),
            "UTF8" => Ok(PayloadFormat::Utf8),
            "JSON" => Ok(PayloadFormat::Json),
            _ => Err(CodecError::UnknownFormatName(name.to_owned())),
        }
    }
}

impl TryFrom<u8> for PayloadFormat {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PayloadFormat::Binary),
            0x01 => Ok(PayloadFormat::Ascii),
            0x02 => Ok(PayloadFormat::Utf8),
            0x0A => Ok(PayloadFormat::Json),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }
}

/// A decoded payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Binary(Vec<u8>),
    Ascii(String),
    Utf8(String),
    Json(Value),
}

impl PayloadValue {
    /// The wire format of this value.
    #[must_use]
    pub fn format(&self) -> PayloadFormat {
        match self {
            PayloadValue::Binary(_) => PayloadFormat::Binary,
            PayloadValue::Ascii(_) => PayloadFormat::Ascii,
            PayloadValue::Utf8(_) => PayloadFormat::Utf8,
            PayloadValue::Json(_) => PayloadFormat::Json,
        }
    }

    /// Encode the value into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error for non-ASCII text in an ASCII payload or a JSON
    /// document that cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            PayloadValue::Binary(bytes) => Ok(bytes.clone()),
            PayloadValue::Ascii(text) => {
                if !text.is_ascii() {
                    return Err(CodecError::NotAscii);
                }
                Ok(text.clone().into_bytes())
            }
            PayloadValue::Utf8(text) => Ok(text.clone().into_bytes()),
            PayloadValue::Json(value) => serde_json::to_vec(value)
                .map_err(|e| CodecError::InvalidJson(e.to_string())),
        }
    }

    /// Decode wire bytes tagged with a raw format nibble.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown formats or data that does not match the
    /// declared format.
    pub fn decode(format: u8, data: &[u8]) -> Result<Self, CodecError> {
        match PayloadFormat::try_from(format)? {
            PayloadFormat::Binary => Ok(PayloadValue::Binary(data.to_vec())),
            PayloadFormat::Ascii => {
                if !data.is_ascii() {
                    return Err(CodecError::NotAscii);
                }
                let text = std::str::from_utf8(data).map_err(|_| CodecError::NotAscii)?;
                Ok(PayloadValue::Ascii(text.to_owned()))
            }
            PayloadFormat::Utf8 => {
                let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(PayloadValue::Utf8(text.to_owned()))
            }
            PayloadFormat::Json => serde_json::from_slice(data)
                .map(PayloadValue::Json)
                .map_err(|e| CodecError::InvalidJson(e.to_string())),
        }
    }

    /// The JSON representation used in HTTP envelopes.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            PayloadValue::Binary(bytes) => {
                Value::Array(bytes.iter().map(|&b| Value::from(b)).collect())
            }
            PayloadValue::Ascii(text) | PayloadValue::Utf8(text) => Value::from(text.as_str()),
            PayloadValue::Json(value) => value.clone(),
        }
    }

    /// Build a value from an HTTP envelope `Payload` field.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON shape does not match the format.
    pub fn from_json(format: PayloadFormat, value: &Value) -> Result<Self, CodecError> {
        match format {
            PayloadFormat::Binary => {
                let items = value.as_array().ok_or(CodecError::BadJsonPayload)?;
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    let n = item.as_u64().ok_or(CodecError::BadJsonPayload)?;
                    let b = u8::try_from(n).map_err(|_| CodecError::BadJsonPayload)?;
                    bytes.push(b);
                }
                Ok(PayloadValue::Binary(bytes))
            }
            PayloadFormat::Ascii => {
                let text = value.as_str().ok_or(CodecError::BadJsonPayload)?;
                if !text.is_ascii() {
                    return Err(CodecError::NotAscii);
                }
                Ok(PayloadValue::Ascii(text.to_owned()))
            }
            PayloadFormat::Utf8 => {
                let text = value.as_str().ok_or(CodecError::BadJsonPayload)?;
                Ok(PayloadValue::Utf8(text.to_owned()))
            }
            PayloadFormat::Json => Ok(PayloadValue::Json(value.clone())),
        }
    }
}
