//! Binary codec for encoding and decoding control-channel messages.
//!
//! Wire format:
//! ```text
//! [version:1][kind:1][reserved:2][payload_len:4][correlation_id:8][payload:N]
//! ```
//! Total header size: 16 bytes. All multi-byte integers are big-endian.
//!
//! The payload is the bincode encoding of `{command, params, error}`.  The
//! header stays hand-encoded so a stream reader can learn the payload length
//! from a fixed-size read before touching bincode.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::protocol::messages::{
    ControlMessage, MessageKind, Parameters, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

/// Errors that can occur during message encoding, decoding, or interpretation.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The kind byte in the header is not a recognized value.
    #[error("unknown message kind: 0x{0:02X}")]
    UnknownMessageKind(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A required message parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    command: &'a str,
    params: &'a Parameters,
    error: Option<&'a str>,
}

#[derive(Deserialize)]
struct PayloadOwned {
    command: String,
    params: Parameters,
    error: Option<String>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ControlMessage`] into a byte vector including the 16-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when the encoded payload exceeds
/// [`MAX_PAYLOAD_SIZE`], or [`ProtocolError::MalformedPayload`] if bincode
/// serialization fails.
///
/// # Examples
///
/// ```rust
/// use projection_core::protocol::{decode_message, encode_message};
/// use projection_core::protocol::messages::ControlMessage;
///
/// let msg = ControlMessage::notification("heartbeat");
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(&PayloadRef {
        command: &msg.command,
        params: &msg.params,
        error: msg.error.as_deref(),
    })
    .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.kind as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&msg.correlation_id.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Validates a header and returns the payload length it declares.
///
/// # Errors
///
/// Returns [`ProtocolError`] for a short header, wrong version, unknown kind,
/// or an oversized payload length.
pub fn payload_len_from_header(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: header.len(),
        });
    }
    if header[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[0]));
    }
    MessageKind::try_from(header[1]).map_err(|_| ProtocolError::UnknownMessageKind(header[1]))?;

    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        trace!(payload_len, "rejecting oversized control payload");
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(payload_len)
}

/// Decodes one [`ControlMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when `bytes` does not yet hold
/// a complete message, and other [`ProtocolError`] variants when it is
/// malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(ControlMessage, usize), ProtocolError> {
    let payload_len = payload_len_from_header(bytes)?;
    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::InsufficientData {
            needed: total_needed,
            available: bytes.len(),
        });
    }

    // Header already validated.
    let kind = MessageKind::try_from(bytes[1])
        .map_err(|_| ProtocolError::UnknownMessageKind(bytes[1]))?;
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&bytes[8..16]);
    let correlation_id = u64::from_be_bytes(id_bytes);

    let payload: PayloadOwned = bincode::deserialize(&bytes[HEADER_SIZE..total_needed])
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    Ok((
        ControlMessage {
            kind,
            command: payload.command,
            correlation_id,
            params: payload.params,
            error: payload.error,
        },
        total_needed,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::commands;

    fn sample_request() -> ControlMessage {
        let mut msg = ControlMessage::request(commands::CREATE_SESSION)
            .with_param("iq", 80)
            .with_param("zr", 0.75f32);
        msg.correlation_id = 42;
        msg
    }

    #[test]
    fn test_encode_writes_header_fields_big_endian() {
        // Arrange
        let msg = sample_request();

        // Act
        let bytes = encode_message(&msg).unwrap();

        // Assert
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], MessageKind::Request as u8);
        assert_eq!(&bytes[2..4], &[0, 0]);
        let declared = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(declared, bytes.len() - HEADER_SIZE);
        assert_eq!(u64::from_be_bytes(bytes[8..16].try_into().unwrap()), 42);
    }

    #[test]
    fn test_decode_preserves_parameter_order_and_error() {
        let msg = ControlMessage::response_to(&sample_request())
            .with_param("z", 1)
            .with_param("a", "two")
            .with_error("busy");
        let bytes = encode_message(&msg).unwrap();

        let (decoded, consumed) = decode_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        let names: Vec<&str> = decoded.params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["z", "a"]);
        assert_eq!(decoded.error.as_deref(), Some("busy"));
    }

    #[test]
    fn test_decode_partial_message_returns_insufficient_data() {
        let bytes = encode_message(&sample_request()).unwrap();

        let header_only = decode_message(&bytes[..10]);
        let truncated = decode_message(&bytes[..bytes.len() - 1]);

        assert!(matches!(header_only, Err(ProtocolError::InsufficientData { .. })));
        assert!(matches!(truncated, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut bytes = encode_message(&sample_request()).unwrap();
        bytes[0] = 0x09;
        assert_eq!(decode_message(&bytes), Err(ProtocolError::UnsupportedVersion(0x09)));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut bytes = encode_message(&sample_request()).unwrap();
        bytes[1] = 0x55;
        assert_eq!(decode_message(&bytes), Err(ProtocolError::UnknownMessageKind(0x55)));
    }

    #[test]
    fn test_header_declaring_oversized_payload_is_rejected_before_reading_it() {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = PROTOCOL_VERSION;
        header[1] = MessageKind::Notification as u8;
        header[4..8].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());

        assert!(matches!(
            payload_len_from_header(&header),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut header = vec![PROTOCOL_VERSION, MessageKind::Notification as u8, 0, 0];
        header.extend_from_slice(&3u32.to_be_bytes());
        header.extend_from_slice(&0u64.to_be_bytes());
        header.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

        assert!(matches!(decode_message(&header), Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_two_messages_in_one_buffer_decode_independently() {
        let first = sample_request();
        let second = ControlMessage::notification(commands::HEARTBEAT);
        let mut buf = encode_message(&first).unwrap();
        buf.extend_from_slice(&encode_message(&second).unwrap());

        let (d1, n1) = decode_message(&buf).unwrap();
        let (d2, n2) = decode_message(&buf[n1..]).unwrap();

        assert_eq!(d1, first);
        assert_eq!(d2, second);
        assert_eq!(n1 + n2, buf.len());
    }
}
