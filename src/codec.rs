//! Byte layout of values stored in the KV store.
//!
//! Every stored value is an entry: a version byte, the expiry as big-endian
//! epoch milliseconds (0 means "never expires"), then the payload. Payloads
//! produced by this crate are JSON text.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for versioned codec operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Data is too short to contain the entry header
    TooShort,
    /// Version byte doesn't match expected version
    UnsupportedVersion { expected: u8, found: u8 },
    /// Payload is not valid JSON for the requested type
    Json(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::TooShort => write!(f, "data too short to contain entry header"),
            CodecError::UnsupportedVersion { expected, found } => {
                write!(
                    f,
                    "unsupported version: expected {}, found {}",
                    expected, found
                )
            }
            CodecError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e.to_string())
    }
}

/// Version for the entry envelope format.
/// When evolving the layout, bump this and add migration logic in `decode_entry`.
pub const ENTRY_VERSION: u8 = 1;

const HEADER_SIZE: usize = 1 + 8;

/// A decoded store entry borrowing its payload from the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    /// Expiry in epoch ms; `None` for entries without a TTL
    pub expires_at_ms: Option<i64>,
    pub payload: &'a [u8],
}

impl Entry<'_> {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(exp) if exp <= now_ms)
    }

    /// Milliseconds left before expiry, `None` when the entry never expires.
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at_ms.map(|exp| (exp - now_ms).max(0))
    }
}

pub fn encode_entry(expires_at_ms: Option<i64>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(ENTRY_VERSION);
    out.extend_from_slice(&expires_at_ms.unwrap_or(0).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn decode_entry(data: &[u8]) -> Result<Entry<'_>, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    let found = data[0];
    if found != ENTRY_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: ENTRY_VERSION,
            found,
        });
    }
    let mut exp = [0u8; 8];
    exp.copy_from_slice(&data[1..HEADER_SIZE]);
    let exp = i64::from_be_bytes(exp);
    Ok(Entry {
        expires_at_ms: if exp == 0 { None } else { Some(exp) },
        payload: &data[HEADER_SIZE..],
    })
}

#[inline]
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

#[inline]
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_without_expiry_never_expires() {
        let raw = encode_entry(None, b"{}");
        let entry = decode_entry(&raw).unwrap();
        assert_eq!(entry.expires_at_ms, None);
        assert!(!entry.is_expired(i64::MAX));
        assert_eq!(entry.payload, b"{}");
    }

    #[test]
    fn entry_expires_at_deadline() {
        let raw = encode_entry(Some(1_000), b"x");
        let entry = decode_entry(&raw).unwrap();
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
        assert_eq!(entry.remaining_ms(400), Some(600));
    }

    #[test]
    fn rejects_short_and_foreign_data() {
        assert_eq!(decode_entry(b"abc"), Err(CodecError::TooShort));
        let mut raw = encode_entry(None, b"x");
        raw[0] = 9;
        assert_eq!(
            decode_entry(&raw),
            Err(CodecError::UnsupportedVersion {
                expected: ENTRY_VERSION,
                found: 9
            })
        );
    }
}
