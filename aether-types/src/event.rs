//! The Aether event: a signed, content-addressed record.
//!
//! An event's id is the BLAKE3 hash of its canonical serialization
//! (network byte order throughout):
//!
//! ```text
//! pubkey ‖ u64be(created_at) ‖ u16be(kind) ‖ tags_blob ‖ content
//! tags_blob = u16be(tag_count)
//!             ‖ for each tag { u8(key_len) ‖ key
//!                              ‖ u16be(value_count)
//!                              ‖ for each value { u16be(value_len) ‖ value } }
//! ```
//!
//! The signature is Ed25519 over the 32-byte id.

use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EventError;
use crate::ids::{EventId, Pubkey, Sig};

/// Maximum content payload in bytes (16 MiB).
pub const MAX_CONTENT_BYTES: usize = 16 * 1024 * 1024;

/// Maximum values per tag.
pub const MAX_TAG_VALUES: usize = 16;

/// Maximum bytes per tag value.
pub const MAX_TAG_VALUE_BYTES: usize = 1024;

/// Maximum bytes per tag key.
pub const MAX_TAG_KEY_BYTES: usize = 8;

/// Storage class selected by an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Stored indefinitely, subject to the configured TTL (kinds 0..=999).
    Immutable,
    /// At most one live event per (pubkey, kind) (kinds 10000..=19999).
    Replaceable,
    /// Fanned out, never persisted (kinds 20000..=29999).
    Ephemeral,
    /// At most one live event per (pubkey, kind, d-value)
    /// (kinds 30000..=39999).
    ParameterizedReplaceable,
}

impl StorageClass {
    /// Classify a kind, or `None` when it falls in no supported range.
    pub fn of(kind: u16) -> Option<Self> {
        match kind {
            0..=999 => Some(Self::Immutable),
            10_000..=19_999 => Some(Self::Replaceable),
            20_000..=29_999 => Some(Self::Ephemeral),
            30_000..=39_999 => Some(Self::ParameterizedReplaceable),
            _ => None,
        }
    }

    /// Whether events of this class are persisted at all.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Ephemeral)
    }
}

/// A single event tag: a short key and an ordered list of values.
///
/// The wire shape is `["key", value, ...]`; a `{key, values}` object is
/// accepted at ingress and normalizes to the same thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key, 1-8 ASCII `[A-Za-z0-9_]` characters.
    pub key: String,
    /// Tag values, UTF-8.
    pub values: Vec<String>,
}

impl Tag {
    /// Build a tag from a key and values.
    pub fn new(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1 + self.values.len()))?;
        seq.serialize_element(&self.key)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagRepr {
    List(Vec<String>),
    Map {
        key: String,
        #[serde(default)]
        values: Vec<String>,
    },
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match TagRepr::deserialize(deserializer)? {
            TagRepr::List(mut items) => {
                if items.is_empty() {
                    return Err(D::Error::custom("tag must carry a key"));
                }
                let key = items.remove(0);
                Ok(Tag { key, values: items })
            }
            TagRepr::Map { key, values } => Ok(Tag { key, values }),
        }
    }
}

fn u64_flexible<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.parse().map_err(D::Error::custom),
    }
}

fn u16_flexible<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u16),
        Str(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.parse().map_err(D::Error::custom),
    }
}

/// A signed, content-addressed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Ed25519 public key of the publisher.
    pub pubkey: Pubkey,
    /// Nanoseconds since the Unix epoch, assigned by the publisher.
    #[serde(deserialize_with = "u64_flexible")]
    pub created_at: u64,
    /// Kind; selects the storage class.
    #[serde(deserialize_with = "u16_flexible")]
    pub kind: u16,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Opaque payload, carried as UTF-8.
    #[serde(default)]
    pub content: String,
    /// BLAKE3 hash of the canonical serialization.
    pub event_id: EventId,
    /// Ed25519 signature over `event_id`.
    pub sig: Sig,
}

impl Event {
    /// Storage class of this event, or `None` for an unsupported kind.
    pub fn storage_class(&self) -> Option<StorageClass> {
        StorageClass::of(self.kind)
    }

    /// The d-value: first value of the first tag keyed `"d"`, else `""`.
    pub fn d_value(&self) -> &str {
        self.tags
            .iter()
            .find(|tag| tag.key == "d")
            .and_then(|tag| tag.values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Canonical serialization hashed to produce the event id.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            self.content.as_bytes(),
        )
    }

    /// Recompute the id from the canonical fields.
    pub fn compute_event_id(&self) -> EventId {
        EventId::from_bytes(*blake3::hash(&self.canonical_bytes()).as_bytes())
    }

    /// Verify the Ed25519 signature over the claimed id.
    pub fn verify_sig(&self) -> bool {
        verify(&self.event_id, &self.sig, &self.pubkey)
    }

    /// Enforce the structural constraints on fields the type system cannot:
    /// tag key charset and lengths, value counts and sizes, content size.
    pub fn validate_structure(&self) -> Result<(), EventError> {
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(EventError::ContentTooLarge {
                size: self.content.len(),
                max: MAX_CONTENT_BYTES,
            });
        }
        if self.tags.len() > u16::MAX as usize {
            return Err(EventError::TooManyTags(self.tags.len()));
        }
        for tag in &self.tags {
            if tag.key.is_empty()
                || tag.key.len() > MAX_TAG_KEY_BYTES
                || !tag
                    .key
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(EventError::BadTagKey(tag.key.clone()));
            }
            if tag.values.len() > MAX_TAG_VALUES {
                return Err(EventError::TooManyTagValues {
                    key: tag.key.clone(),
                    count: tag.values.len(),
                    max: MAX_TAG_VALUES,
                });
            }
            for value in &tag.values {
                if value.len() > MAX_TAG_VALUE_BYTES {
                    return Err(EventError::TagValueTooLong {
                        max: MAX_TAG_VALUE_BYTES,
                    });
                }
            }
        }
        Ok(())
    }

    /// Size of this event's canonical serialization plus id and signature,
    /// the figure relay size limits are enforced against.
    pub fn wire_size(&self) -> usize {
        self.canonical_bytes().len() + 32 + 64
    }

    /// Build and sign an event from a 32-byte Ed25519 seed. The id is
    /// computed from the canonical fields before signing.
    ///
    /// This is the client-side construction path; relays only verify.
    pub fn signed(
        seed: &[u8; 32],
        kind: u16,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        use ed25519_dalek::{Signer, SigningKey};

        let signing_key = SigningKey::from_bytes(seed);
        let pubkey = Pubkey::from_bytes(signing_key.verifying_key().to_bytes());
        let content = content.into();
        let event_id = EventId::from_bytes(
            *blake3::hash(&canonical_bytes(
                &pubkey,
                created_at,
                kind,
                &tags,
                content.as_bytes(),
            ))
            .as_bytes(),
        );
        let sig = Sig::from_bytes(signing_key.sign(event_id.as_bytes()).to_bytes());
        Self {
            pubkey,
            created_at,
            kind,
            tags,
            content,
            event_id,
            sig,
        }
    }
}

/// Canonical serialization of the hashed fields.
pub fn canonical_bytes(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 8 + 2 + 64 + content.len());
    out.extend_from_slice(pubkey.as_bytes());
    out.extend_from_slice(&created_at.to_be_bytes());
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(tags.len() as u16).to_be_bytes());
    for tag in tags {
        let key = tag.key.as_bytes();
        out.push(key.len() as u8);
        out.extend_from_slice(key);
        out.extend_from_slice(&(tag.values.len() as u16).to_be_bytes());
        for value in &tag.values {
            let value = value.as_bytes();
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
        }
    }
    out.extend_from_slice(content);
    out
}

/// Verify an Ed25519 signature over an event id.
pub fn verify(event_id: &EventId, sig: &Sig, pubkey: &Pubkey) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(key) = VerifyingKey::from_bytes(pubkey.as_bytes()) else {
        return false;
    };
    let signature = Signature::from_bytes(sig.as_bytes());
    key.verify(event_id.as_bytes(), &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, values: &[&str]) -> Tag {
        Tag::new(key, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn canonical_layout_matches_reference() {
        let event = Event::signed(
            &[1u8; 32],
            7,
            0x0102,
            vec![tag("d", &["x"])],
            "hi",
        );
        let bytes = event.canonical_bytes();

        let mut expected = Vec::new();
        expected.extend_from_slice(event.pubkey.as_bytes());
        expected.extend_from_slice(&0x0102u64.to_be_bytes());
        expected.extend_from_slice(&7u16.to_be_bytes());
        // one tag: key "d", one value "x"
        expected.extend_from_slice(&1u16.to_be_bytes());
        expected.push(1);
        expected.extend_from_slice(b"d");
        expected.extend_from_slice(&1u16.to_be_bytes());
        expected.extend_from_slice(&1u16.to_be_bytes());
        expected.extend_from_slice(b"x");
        expected.extend_from_slice(b"hi");

        assert_eq!(bytes, expected);
    }

    #[test]
    fn event_id_is_deterministic() {
        let a = Event::signed(&[1u8; 32], 1, 42, vec![], "payload");
        let b = Event::signed(&[1u8; 32], 1, 42, vec![], "payload");
        assert_eq!(a.event_id, b.event_id);
        assert_eq!(a.compute_event_id(), a.event_id);
    }

    #[test]
    fn any_field_change_changes_the_id() {
        let base = Event::signed(&[1u8; 32], 1, 42, vec![tag("t", &["a"])], "payload");
        let by_kind = Event::signed(&[1u8; 32], 2, 42, vec![tag("t", &["a"])], "payload");
        let by_time = Event::signed(&[1u8; 32], 1, 43, vec![tag("t", &["a"])], "payload");
        let by_tags = Event::signed(&[1u8; 32], 1, 42, vec![tag("t", &["b"])], "payload");
        let by_content = Event::signed(&[1u8; 32], 1, 42, vec![tag("t", &["a"])], "payloae");
        let by_key = Event::signed(&[2u8; 32], 1, 42, vec![tag("t", &["a"])], "payload");
        for other in [by_kind, by_time, by_tags, by_content, by_key] {
            assert_ne!(base.event_id, other.event_id);
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        // Seed 01 x 32, content "hello", kind 1, created_at 1, no tags.
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "hello");
        assert_eq!(event.compute_event_id(), event.event_id);
        assert!(event.verify_sig());
    }

    #[test]
    fn tampered_signature_fails() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "hello");
        let mut bad_sig = *event.sig.as_bytes();
        bad_sig[0] ^= 0xFF;
        let tampered = Event {
            sig: Sig::from_bytes(bad_sig),
            ..event
        };
        assert!(!tampered.verify_sig());
    }

    #[test]
    fn storage_class_ranges() {
        assert_eq!(StorageClass::of(0), Some(StorageClass::Immutable));
        assert_eq!(StorageClass::of(999), Some(StorageClass::Immutable));
        assert_eq!(StorageClass::of(1000), None);
        assert_eq!(StorageClass::of(9999), None);
        assert_eq!(StorageClass::of(10_000), Some(StorageClass::Replaceable));
        assert_eq!(StorageClass::of(19_999), Some(StorageClass::Replaceable));
        assert_eq!(StorageClass::of(20_000), Some(StorageClass::Ephemeral));
        assert_eq!(StorageClass::of(29_999), Some(StorageClass::Ephemeral));
        assert_eq!(
            StorageClass::of(30_000),
            Some(StorageClass::ParameterizedReplaceable)
        );
        assert_eq!(
            StorageClass::of(39_999),
            Some(StorageClass::ParameterizedReplaceable)
        );
        assert_eq!(StorageClass::of(40_000), None);
        assert!(!StorageClass::Ephemeral.is_persistent());
        assert!(StorageClass::Immutable.is_persistent());
    }

    #[test]
    fn d_value_is_first_value_of_first_d_tag() {
        let event = Event::signed(
            &[1u8; 32],
            30_000,
            1,
            vec![tag("t", &["other"]), tag("d", &["slug", "extra"]), tag("d", &["late"])],
            "",
        );
        assert_eq!(event.d_value(), "slug");

        let no_d = Event::signed(&[1u8; 32], 30_000, 1, vec![], "");
        assert_eq!(no_d.d_value(), "");
    }

    #[test]
    fn structural_rejects_bad_tag_key() {
        for key in ["", "toolongkey", "sp ace", "hé"] {
            let event = Event::signed(&[1u8; 32], 1, 1, vec![tag(key, &["v"])], "");
            assert!(
                matches!(event.validate_structure(), Err(EventError::BadTagKey(_))),
                "key {key:?} should be rejected"
            );
        }
        let ok = Event::signed(&[1u8; 32], 1, 1, vec![tag("A_z9", &["v"])], "");
        assert!(ok.validate_structure().is_ok());
    }

    #[test]
    fn structural_rejects_too_many_tag_values() {
        let values: Vec<String> = (0..17).map(|i| i.to_string()).collect();
        let event = Event::signed(&[1u8; 32], 1, 1, vec![Tag::new("t", values)], "");
        assert!(matches!(
            event.validate_structure(),
            Err(EventError::TooManyTagValues { .. })
        ));
    }

    #[test]
    fn structural_rejects_oversized_tag_value() {
        let event = Event::signed(
            &[1u8; 32],
            1,
            1,
            vec![tag("t", &[&"v".repeat(1025)])],
            "",
        );
        assert!(matches!(
            event.validate_structure(),
            Err(EventError::TagValueTooLong { .. })
        ));
    }

    #[test]
    fn wire_size_covers_canonical_id_and_sig() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![tag("d", &["x"])], "hello");
        assert_eq!(event.wire_size(), event.canonical_bytes().len() + 32 + 64);
    }

    #[test]
    fn json_roundtrip_preserves_id() {
        let event = Event::signed(&[3u8; 32], 10_001, 99, vec![tag("d", &["k"])], "body");
        let json = serde_json::to_string(&event).unwrap();
        let restored: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, restored);
        assert_eq!(restored.compute_event_id(), restored.event_id);
    }

    #[test]
    fn ingress_coerces_string_integers() {
        let event = Event::signed(&[3u8; 32], 1, 7, vec![], "x");
        let mut value = serde_json::to_value(&event).unwrap();
        value["created_at"] = serde_json::Value::String("7".into());
        value["kind"] = serde_json::Value::String("1".into());
        let restored: Event = serde_json::from_value(value).unwrap();
        assert_eq!(restored.created_at, 7);
        assert_eq!(restored.kind, 1);
    }

    #[test]
    fn tag_accepts_map_shape() {
        let t: Tag = serde_json::from_str(r#"{"key":"c","values":["vision"]}"#).unwrap();
        assert_eq!(t, tag("c", &["vision"]));
        let l: Tag = serde_json::from_str(r#"["c","vision"]"#).unwrap();
        assert_eq!(l, t);
    }
}
