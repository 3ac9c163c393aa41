//! JSON envelope codec for peer messages.
//!
//! Wire format: one JSON object per payload, with the routing key merged
//! alongside the payload's own fields:
//!
//! ```text
//! {"eventName": "<event name>", ...payload fields}
//! ```
//!
//! Receivers read `eventName` first and hand the untouched bytes to whichever
//! handler registered for that name; the handler then decodes the payload
//! type it expects.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding a peer message.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The payload could not be serialized to JSON.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// The bytes are not a JSON object, or a field has the wrong shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload carries no `eventName` field.
    #[error("payload has no eventName")]
    MissingEventName,

    /// The payload is tagged for a different handler.
    #[error("expected event {expected:?}, got {actual:?}")]
    UnexpectedEvent { expected: String, actual: String },
}

#[derive(Serialize)]
struct Envelope<'a, T: ?Sized> {
    #[serde(rename = "eventName")]
    event_name: &'a str,
    #[serde(flatten)]
    payload: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    #[serde(rename = "eventName")]
    event_name: Option<String>,
}

/// Serializes `payload` into an envelope tagged with `event_name`.
///
/// `payload` must serialize as a JSON object (a struct or a map).
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use peerkit_core::protocol::{encode_event, event_name};
///
/// let bytes = encode_event("chat", &serde_json::json!({ "text": "hi" })).unwrap();
/// assert_eq!(event_name(&bytes).unwrap().as_deref(), Some("chat"));
/// ```
pub fn encode_event<T: Serialize + ?Sized>(
    event_name: &str,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(&Envelope {
        event_name,
        payload,
    })
    .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Reads the `eventName` tag without decoding the rest of the payload.
///
/// Returns `Ok(None)` for a JSON object that has no tag.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the bytes are not a JSON object.
pub fn event_name(bytes: &[u8]) -> Result<Option<String>, ProtocolError> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    Ok(header.event_name)
}

/// Decodes a payload of type `T`, checking that it is tagged `expected`.
///
/// # Errors
///
/// Returns [`ProtocolError::MissingEventName`] or
/// [`ProtocolError::UnexpectedEvent`] when the tag does not match, and
/// [`ProtocolError::MalformedPayload`] when the fields do not fit `T`.
pub fn decode_event<T: DeserializeOwned>(bytes: &[u8], expected: &str) -> Result<T, ProtocolError> {
    match event_name(bytes)? {
        Some(actual) if actual == expected => {}
        Some(actual) => {
            return Err(ProtocolError::UnexpectedEvent {
                expected: expected.to_string(),
                actual,
            })
        }
        None => return Err(ProtocolError::MissingEventName),
    }
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{HostEvent, ProbeMessage, HOST_SELECTOR_EVENT, LOOPBACK_EVENT};
    use serde_json::Value;

    #[test]
    fn test_encode_event_merges_tag_with_payload_fields() {
        // Arrange
        let event = HostEvent::announce(1_715_000_000.5);

        // Act
        let bytes = encode_event(HOST_SELECTOR_EVENT, &event).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        // Assert
        assert_eq!(value["eventName"], "host-selector");
        assert_eq!(value["kind"], "announceHost");
        assert_eq!(value["hostStartTime"], 1_715_000_000.5);
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_event_name_returns_none_for_untagged_object() {
        assert_eq!(event_name(br#"{"ping":""}"#), Ok(None));
    }

    #[test]
    fn test_event_name_rejects_non_json() {
        let result = event_name(b"\x00\x01binary");
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_event_rejects_wrong_tag() {
        // Arrange
        let bytes = encode_event(LOOPBACK_EVENT, &ProbeMessage::ping(1)).unwrap();

        // Act
        let result = decode_event::<HostEvent>(&bytes, HOST_SELECTOR_EVENT);

        // Assert
        assert_eq!(
            result,
            Err(ProtocolError::UnexpectedEvent {
                expected: "host-selector".to_string(),
                actual: "loopback-test".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_event_rejects_missing_tag() {
        let result = decode_event::<HostEvent>(br#"{"kind":"announceHost","hostStartTime":1.0}"#, HOST_SELECTOR_EVENT);
        assert_eq!(result, Err(ProtocolError::MissingEventName));
    }

    #[test]
    fn test_decode_event_rejects_wrong_payload_shape() {
        let bytes = br#"{"eventName":"host-selector","kind":"resign"}"#;
        let result = decode_event::<HostEvent>(bytes, HOST_SELECTOR_EVENT);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_event_reads_probe_nonce() {
        let bytes = br#"{"eventName":"loopback-test","kind":"pong","nonce":42}"#;
        let probe: ProbeMessage = decode_event(bytes, LOOPBACK_EVENT).unwrap();
        assert_eq!(probe, ProbeMessage::pong(42));
    }
}
