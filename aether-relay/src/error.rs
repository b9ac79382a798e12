//! Error types for the relay.
//!
//! Every failure mode at an adapter boundary has a named discriminant and
//! a stable wire code; gateways translate discriminants into the
//! surface-appropriate shape instead of letting errors unwind.

use aether_types::{EventError, WireError};

/// Top-level relay error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Event validation failure.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Kind fell outside every storage class; the validator should have
    /// rejected it upstream.
    #[error("kind {0} has no storage class")]
    UnsupportedKind(u16),

    /// A stored row failed to decode back into an event.
    #[error("corrupt stored event: {reason}")]
    Corrupt {
        /// What failed to decode.
        reason: String,
    },
}

/// Event validation failures, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Structural constraint violation (field sizes, tags, content).
    #[error("invalid event: {0}")]
    Structure(#[from] EventError),

    /// Event exceeds the relay's configured size limit.
    #[error("event is {size} bytes, relay maximum is {max}")]
    EventTooLarge {
        /// Total event size: canonical serialization plus id and
        /// signature.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Recomputed canonical hash differs from the claimed `event_id`.
    #[error("event_id does not match canonical hash")]
    IdMismatch,

    /// Ed25519 signature does not verify.
    #[error("signature does not verify")]
    BadSignature,

    /// Kind is outside every storage class.
    #[error("kind {0} is outside every storage class")]
    KindOutOfRange(u16),

    /// `created_at` is too far in the future.
    #[error("created_at is {skew_ns}ns in the future, allowed {allowed_ns}ns")]
    TimestampOutOfRange {
        /// Observed future skew.
        skew_ns: u64,
        /// Configured allowance.
        allowed_ns: u64,
    },

    /// Event id does not meet the configured proof-of-work difficulty.
    #[error("event_id has {got} leading zero bits, difficulty requires {need}")]
    InsufficientPow {
        /// Leading zero bits observed.
        got: u32,
        /// Required difficulty.
        need: u32,
    },

    /// Publisher exceeded the configured rate limit.
    #[error("publisher rate limit exceeded")]
    RateLimited,
}

impl ValidationError {
    /// The stable wire code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Structure(_) => "invalid_event",
            Self::EventTooLarge { .. } => "validation_failed",
            Self::IdMismatch => "invalid_event_id",
            Self::BadSignature => "invalid_signature",
            Self::KindOutOfRange(_) => "invalid_kind",
            Self::TimestampOutOfRange { .. } => "timestamp_out_of_range",
            Self::InsufficientPow { .. } => "insufficient_pow",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Session protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    /// Message type not valid in the current session state.
    #[error("unexpected message type {got} in state {state}")]
    UnexpectedMessage {
        /// Message type name received.
        got: &'static str,
        /// Session state name.
        state: &'static str,
    },

    /// HELLO offered no mutually supported frame format.
    #[error("no mutually supported frame format")]
    NoCommonFormat,

    /// Noise upgrade requested without a client public key.
    #[error("noise upgrade requires a client public key")]
    MissingNoiseKey,

    /// Noise layer failure.
    #[error("noise error: {0}")]
    Noise(#[from] crate::noise::NoiseError),
}

impl ProtocolError {
    /// The stable wire code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Wire(_) => "invalid_message",
            Self::UnexpectedMessage { .. } => "invalid_message",
            Self::NoCommonFormat => "invalid_message",
            Self::MissingNoiseKey => "invalid_message",
            Self::Noise(_) => "invalid_message",
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_codes_are_stable() {
        assert_eq!(
            ValidationError::EventTooLarge { size: 1, max: 0 }.code(),
            "validation_failed"
        );
        assert_eq!(ValidationError::IdMismatch.code(), "invalid_event_id");
        assert_eq!(ValidationError::BadSignature.code(), "invalid_signature");
        assert_eq!(ValidationError::KindOutOfRange(5000).code(), "invalid_kind");
        assert_eq!(
            ValidationError::TimestampOutOfRange {
                skew_ns: 1,
                allowed_ns: 0
            }
            .code(),
            "timestamp_out_of_range"
        );
        assert_eq!(
            ValidationError::InsufficientPow { got: 0, need: 8 }.code(),
            "insufficient_pow"
        );
        assert_eq!(ValidationError::RateLimited.code(), "rate_limited");
    }
}
