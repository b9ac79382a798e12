//! Error types for aether-types.

/// Errors from parsing fixed-size identity fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Field had the wrong byte length.
    #[error("{field} must be {expected} bytes, got {actual}")]
    BadLength {
        /// Name of the offending field.
        field: &'static str,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// Field was not valid hex.
    #[error("{field} must be a hex string")]
    BadHex {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Structural validation errors for events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Tag key violates the 1-8 `[A-Za-z0-9_]` constraint.
    #[error("tag key {0:?} must be 1-8 ASCII alphanumeric or underscore characters")]
    BadTagKey(String),

    /// Tag carries too many values.
    #[error("tag {key:?} carries {count} values, maximum is {max}")]
    TooManyTagValues {
        /// Key of the offending tag.
        key: String,
        /// Number of values supplied.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Single tag value too long.
    #[error("tag value exceeds {max} bytes")]
    TagValueTooLong {
        /// Maximum allowed bytes per value.
        max: usize,
    },

    /// Too many tags for the canonical u16 count.
    #[error("event carries {0} tags, maximum is 65535")]
    TooManyTags(usize),

    /// Content payload too large.
    #[error("content is {size} bytes, maximum is {max}")]
    ContentTooLarge {
        /// Actual content size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Kind does not fall in any storage class range.
    #[error("kind {0} is outside every storage class range")]
    KindOutOfRange(u16),
}

/// Errors from filter normalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// A field that should hold an integer did not.
    #[error("filter field {0:?} must be an unsigned integer")]
    BadInt(&'static str),

    /// A field that should hold a list did not.
    #[error("filter field {0:?} must be a list")]
    BadList(&'static str),

    /// Pubkey prefix was not hex or too long.
    #[error("pubkey prefix must be hex of at most 32 bytes")]
    BadPrefix,

    /// Tag filter entries were neither pairs nor a key->values map.
    #[error("tag filters must be [key, value] pairs or a {{key: [values]}} map")]
    BadTagFilter,
}

/// Errors from the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame could not be decoded in the negotiated format.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Human-readable decode failure.
        reason: String,
    },

    /// Binary envelope carried an unknown message type tag.
    #[error("unknown message type tag {0}")]
    UnknownType(u8),

    /// Binary envelope tag disagrees with the inner payload type.
    #[error("envelope tag {tag} does not match payload type {payload}")]
    TagMismatch {
        /// Tag from the envelope.
        tag: u8,
        /// Tag implied by the inner payload.
        payload: u8,
    },

    /// Length-prefixed frame exceeds the transport limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    Oversized {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}
