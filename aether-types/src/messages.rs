//! Protocol messages carried inside wire envelopes.
//!
//! In JSON mode the envelope is the message object itself, discriminated
//! by the `type` field. In binary mode the same JSON bytes travel as the
//! payload of a compact two-field envelope (see [`crate::wire`]).

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::filter::Filter;
use crate::ids::EventId;
use crate::wire::WireFormat;

/// All protocol messages, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client opens a session.
    Hello(Hello),
    /// Server answers a HELLO.
    Welcome(Welcome),
    /// Client submits an event.
    Publish(Publish),
    /// Client opens a subscription.
    Subscribe(Subscribe),
    /// Client closes a subscription.
    Unsubscribe(Unsubscribe),
    /// Server delivers a matching event to a subscription.
    Event(EventFrame),
    /// Server acknowledges a publish.
    Ack(Ack),
    /// Server reports a protocol or validation error.
    Error(ErrorFrame),
    /// Encrypted envelope after a transport-encryption upgrade.
    Noise(NoiseFrame),
}

impl Message {
    /// Numeric type tag used by the binary envelope.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Hello(_) => 0,
            Message::Welcome(_) => 1,
            Message::Publish(_) => 2,
            Message::Subscribe(_) => 3,
            Message::Unsubscribe(_) => 4,
            Message::Event(_) => 5,
            Message::Ack(_) => 6,
            Message::Error(_) => 7,
            Message::Noise(_) => 8,
        }
    }

    /// Highest assigned type tag.
    pub const MAX_TAG: u8 = 8;
}

/// Session-encryption parameters exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseInfo {
    /// Whether the peer requires the encryption upgrade.
    pub required: bool,
    /// X25519 public key, hex, 32 bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version (currently 1).
    pub version: u32,
    /// Frame formats the client can speak, in no particular order.
    pub formats: Vec<WireFormat>,
    /// Transport-encryption request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseInfo>,
}

/// Server handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Protocol version the server speaks.
    pub version: u32,
    /// Negotiated frame format for the rest of the session.
    pub format: WireFormat,
    /// Transport-encryption parameters, present when the upgrade is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseInfo>,
}

/// Event submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    /// The signed event.
    pub event: Event,
}

/// Subscription request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    /// Connection-local subscription id.
    pub sub_id: String,
    /// Filters; an event matching any of them is delivered.
    pub filters: Vec<Filter>,
}

/// Subscription close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    /// Connection-local subscription id.
    pub sub_id: String,
}

/// Event delivery to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Subscription the event matched.
    pub sub_id: String,
    /// The event.
    pub event: Event,
}

/// Publish acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the acknowledged event.
    pub event_id: EventId,
    /// Whether the event was accepted.
    pub accepted: bool,
    /// Machine-readable reason (an error code, or `"duplicate"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Machine-readable error code.
    pub code: String,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorFrame {
    /// Build an error frame from a code and detail message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
        }
    }
}

/// Encrypted envelope: `u64be(counter) ‖ AEAD ciphertext`, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseFrame {
    /// Counter prefix and ciphertext, hex.
    pub payload_hex: String,
}
