//! Frame codec for the two negotiated wire formats.
//!
//! - `json`: the message object itself, UTF-8.
//! - `binary`: a MessagePack two-field envelope `{tag, payload}` where the
//!   payload is the JSON encoding of the message. The envelope is binary;
//!   the inner payload stays introspectable.
//!
//! Stream transports frame envelopes with a 4-byte big-endian length
//! prefix; message-oriented transports (WebSocket) carry them as-is.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::messages::Message;

/// Frame formats negotiated at handshake. Binary is preferred when both
/// sides support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// MessagePack envelope with a JSON inner payload.
    Binary,
    /// Plain JSON object.
    Json,
}

/// Maximum envelope size accepted by the length-prefixed framing, sized to
/// fit a maximum-content event with headroom.
pub const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct BinaryEnvelope {
    tag: u8,
    payload: Vec<u8>,
}

/// Encode a message in the given wire format.
pub fn encode(message: &Message, format: WireFormat) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(message).map_err(|e| WireError::MalformedFrame {
        reason: e.to_string(),
    })?;
    match format {
        WireFormat::Json => Ok(json),
        WireFormat::Binary => rmp_serde::to_vec(&BinaryEnvelope {
            tag: message.tag(),
            payload: json,
        })
        .map_err(|e| WireError::MalformedFrame {
            reason: e.to_string(),
        }),
    }
}

/// Decode a message in the given wire format.
pub fn decode(raw: &[u8], format: WireFormat) -> Result<Message, WireError> {
    match format {
        WireFormat::Json => {
            serde_json::from_slice(raw).map_err(|e| WireError::MalformedFrame {
                reason: e.to_string(),
            })
        }
        WireFormat::Binary => {
            let envelope: BinaryEnvelope =
                rmp_serde::from_slice(raw).map_err(|e| WireError::MalformedFrame {
                    reason: e.to_string(),
                })?;
            if envelope.tag > Message::MAX_TAG {
                return Err(WireError::UnknownType(envelope.tag));
            }
            let message: Message =
                serde_json::from_slice(&envelope.payload).map_err(|e| {
                    WireError::MalformedFrame {
                        reason: e.to_string(),
                    }
                })?;
            if message.tag() != envelope.tag {
                return Err(WireError::TagMismatch {
                    tag: envelope.tag,
                    payload: message.tag(),
                });
            }
            Ok(message)
        }
    }
}

/// Prepend the 4-byte big-endian length prefix for stream transports.
pub fn frame(envelope: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + envelope.len());
    out.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
    out.extend_from_slice(envelope);
    out
}

/// Split one length-prefixed envelope off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
/// `Ok(Some((envelope, consumed)))` otherwise.
pub fn deframe(buf: &[u8]) -> Result<Option<(&[u8], usize)>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversized {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((&buf[4..4 + len], 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::ids::EventId;
    use crate::messages::{Ack, ErrorFrame, Hello, NoiseInfo, Publish, Subscribe, Welcome};

    fn samples() -> Vec<Message> {
        vec![
            Message::Hello(Hello {
                version: 1,
                formats: vec![WireFormat::Binary, WireFormat::Json],
                noise: Some(NoiseInfo {
                    required: true,
                    pubkey: Some("ab".repeat(32)),
                }),
            }),
            Message::Welcome(Welcome {
                version: 1,
                format: WireFormat::Binary,
                noise: None,
            }),
            Message::Publish(Publish {
                event: Event::signed(&[1u8; 32], 1, 42, vec![], "hello"),
            }),
            Message::Subscribe(Subscribe {
                sub_id: "sub-1".into(),
                filters: vec![crate::Filter::default()],
            }),
            Message::Ack(Ack {
                event_id: EventId::from_bytes([5; 32]),
                accepted: false,
                reason: Some("invalid_signature".into()),
            }),
            Message::Error(ErrorFrame::new("invalid_message", "what")),
        ]
    }

    #[test]
    fn roundtrip_json() {
        for msg in samples() {
            let bytes = encode(&msg, WireFormat::Json).unwrap();
            let restored = decode(&bytes, WireFormat::Json).unwrap();
            assert_eq!(msg, restored);
        }
    }

    #[test]
    fn roundtrip_binary() {
        for msg in samples() {
            let bytes = encode(&msg, WireFormat::Binary).unwrap();
            let restored = decode(&bytes, WireFormat::Binary).unwrap();
            assert_eq!(msg, restored);
        }
    }

    #[test]
    fn binary_envelope_has_two_fields() {
        let msg = Message::Welcome(Welcome {
            version: 1,
            format: WireFormat::Json,
            noise: None,
        });
        let bytes = encode(&msg, WireFormat::Binary).unwrap();
        let envelope: BinaryEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(envelope.tag, 1);
        // inner payload stays introspectable JSON
        let inner: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(inner["type"], "welcome");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = rmp_serde::to_vec(&BinaryEnvelope {
            tag: 99,
            payload: b"{}".to_vec(),
        })
        .unwrap();
        assert!(matches!(
            decode(&bytes, WireFormat::Binary),
            Err(WireError::UnknownType(99))
        ));
    }

    #[test]
    fn mismatched_tag_is_rejected() {
        let payload = serde_json::to_vec(&Message::Unsubscribe(crate::Unsubscribe {
            sub_id: "s".into(),
        }))
        .unwrap();
        let bytes = rmp_serde::to_vec(&BinaryEnvelope { tag: 2, payload }).unwrap();
        assert!(matches!(
            decode(&bytes, WireFormat::Binary),
            Err(WireError::TagMismatch { tag: 2, payload: 4 })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(b"not json", WireFormat::Json),
            Err(WireError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode(&[0xC1, 0x00, 0xFF], WireFormat::Binary),
            Err(WireError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn framing_roundtrip() {
        let envelope = b"hello world";
        let framed = frame(envelope);
        assert_eq!(&framed[..4], &(envelope.len() as u32).to_be_bytes());
        let (parsed, consumed) = deframe(&framed).unwrap().unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn deframe_waits_for_complete_frames() {
        let framed = frame(b"abcdef");
        assert!(deframe(&framed[..3]).unwrap().is_none());
        assert!(deframe(&framed[..7]).unwrap().is_none());
        assert!(deframe(&framed).unwrap().is_some());
    }

    #[test]
    fn deframe_rejects_oversized_declarations() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            deframe(&buf),
            Err(WireError::Oversized { .. })
        ));
    }
}
