//! Native session state machine.
//!
//! One `WireSession` per connection: NEW until a HELLO arrives, then
//! ACTIVE with a negotiated frame format and, optionally, a noise layer
//! wrapping every subsequent frame in both directions. The session owns
//! format sniffing, negotiation, and the encrypt/decrypt path; what to do
//! with decoded messages is the gateway's business.

use aether_types::{
    decode, encode, Hello, Message, NoiseFrame, NoiseInfo, Welcome, WireFormat,
};

use crate::error::ProtocolError;
use crate::noise::{NoiseKeypair, NoiseSession};

/// Protocol version spoken by this relay.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for HELLO.
    New,
    /// Handshake done; steady-state message processing.
    Active,
    /// Terminal.
    Closed,
}

/// An encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Envelope bytes.
    pub bytes: Vec<u8>,
    /// Whether to send as a binary transport frame (vs text).
    pub binary: bool,
}

/// Per-connection wire state.
pub struct WireSession {
    phase: SessionPhase,
    format: WireFormat,
    noise: Option<NoiseSession>,
}

impl Default for WireSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WireSession {
    /// A fresh session awaiting HELLO.
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::New,
            format: WireFormat::Json,
            noise: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Negotiated frame format.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Whether the transport-encryption upgrade is active.
    pub fn noise_active(&self) -> bool {
        self.noise.is_some()
    }

    /// Whether repeated AEAD failures make this session fatal.
    pub fn noise_fatal(&self) -> bool {
        self.noise.as_ref().is_some_and(|n| n.is_fatal())
    }

    /// Mark the session closed.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Consume the client HELLO and produce the encoded WELCOME.
    ///
    /// The frame format is sniffed from the transport frame kind before
    /// negotiation settles it: binary preferred over json when the client
    /// offers both. When the client requires the noise upgrade, the
    /// WELCOME itself goes out in the clear and every later frame is
    /// wrapped.
    pub fn process_hello(
        &mut self,
        raw: &[u8],
        binary_frame: bool,
    ) -> Result<OutboundFrame, ProtocolError> {
        debug_assert_eq!(self.phase, SessionPhase::New);
        let sniffed = if binary_frame {
            WireFormat::Binary
        } else {
            WireFormat::Json
        };
        let hello = match decode(raw, sniffed)? {
            Message::Hello(hello) => hello,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    got: message_name(&other),
                    state: "new",
                })
            }
        };

        let format = negotiate_format(&hello)?;
        let (welcome_noise, pending) = self.prepare_noise(&hello)?;

        let welcome = Message::Welcome(Welcome {
            version: PROTOCOL_VERSION,
            format,
            noise: welcome_noise,
        });
        let bytes = encode(&welcome, format)?;

        self.format = format;
        self.noise = pending;
        self.phase = SessionPhase::Active;

        Ok(OutboundFrame {
            bytes,
            binary: format == WireFormat::Binary,
        })
    }

    fn prepare_noise(
        &self,
        hello: &Hello,
    ) -> Result<(Option<NoiseInfo>, Option<NoiseSession>), ProtocolError> {
        let Some(request) = &hello.noise else {
            return Ok((None, None));
        };
        if !request.required {
            return Ok((None, None));
        }
        let peer_hex = request
            .pubkey
            .as_deref()
            .ok_or(ProtocolError::MissingNoiseKey)?;
        let peer_bytes: [u8; 32] = hex::decode(peer_hex)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::MissingNoiseKey)?;

        let keypair = NoiseKeypair::generate();
        let key = keypair.derive_shared_key(&peer_bytes);
        let info = NoiseInfo {
            required: true,
            pubkey: Some(hex::encode(keypair.public)),
        };
        Ok((Some(info), Some(NoiseSession::new(&key))))
    }

    /// Decode an inbound steady-state frame, unwrapping the noise layer
    /// when active.
    pub fn decode_inbound(&mut self, raw: &[u8]) -> Result<Message, ProtocolError> {
        debug_assert_eq!(self.phase, SessionPhase::Active);
        match &mut self.noise {
            None => Ok(decode(raw, self.format)?),
            Some(noise) => {
                let frame = match decode(raw, self.format)? {
                    Message::Noise(frame) => frame,
                    other => {
                        return Err(ProtocolError::UnexpectedMessage {
                            got: message_name(&other),
                            state: "active(noise)",
                        })
                    }
                };
                let sealed = hex::decode(&frame.payload_hex).map_err(|_| {
                    ProtocolError::Wire(aether_types::WireError::MalformedFrame {
                        reason: "noise payload is not hex".into(),
                    })
                })?;
                let plaintext = noise.open(&sealed)?;
                Ok(decode(&plaintext, self.format)?)
            }
        }
    }

    /// Encode an outbound message, wrapping it in the noise layer when
    /// active.
    pub fn encode_outbound(&mut self, message: &Message) -> Result<OutboundFrame, ProtocolError> {
        let bytes = match &mut self.noise {
            None => encode(message, self.format)?,
            Some(noise) => {
                let inner = encode(message, self.format)?;
                let sealed = noise.seal(&inner)?;
                let wrapper = Message::Noise(NoiseFrame {
                    payload_hex: hex::encode(sealed),
                });
                encode(&wrapper, self.format)?
            }
        };
        Ok(OutboundFrame {
            bytes,
            binary: self.format == WireFormat::Binary,
        })
    }
}

fn negotiate_format(hello: &Hello) -> Result<WireFormat, ProtocolError> {
    if hello.formats.contains(&WireFormat::Binary) {
        Ok(WireFormat::Binary)
    } else if hello.formats.contains(&WireFormat::Json) {
        Ok(WireFormat::Json)
    } else {
        Err(ProtocolError::NoCommonFormat)
    }
}

/// Message type name, for diagnostics.
pub fn message_name(message: &Message) -> &'static str {
    match message {
        Message::Hello(_) => "hello",
        Message::Welcome(_) => "welcome",
        Message::Publish(_) => "publish",
        Message::Subscribe(_) => "subscribe",
        Message::Unsubscribe(_) => "unsubscribe",
        Message::Event(_) => "event",
        Message::Ack(_) => "ack",
        Message::Error(_) => "error",
        Message::Noise(_) => "noise",
    }
}
