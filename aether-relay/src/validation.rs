//! The inbound event validation pipeline.
//!
//! Checks run in a fixed order so every surface reports the same failure
//! for the same bad event: structure, total size, canonical hash,
//! signature, kind range, timestamp skew, proof-of-work, then the
//! publish rate limit. Hash comparison is constant-time.

use aether_types::{Event, StorageClass};

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use crate::limits::RateLimits;
use crate::pow;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Validate one inbound event against relay policy.
///
/// `now_ns` is passed in so callers (and tests) control the clock.
pub fn validate_event(
    event: &Event,
    policy: &ValidationConfig,
    limits: &RateLimits,
    now_ns: u64,
) -> Result<(), ValidationError> {
    event.validate_structure()?;

    if let Some(max) = policy.max_event_size_bytes {
        let size = event.wire_size();
        if size > max {
            return Err(ValidationError::EventTooLarge { size, max });
        }
    }

    let computed = event.compute_event_id();
    if !computed.ct_eq(&event.event_id) {
        return Err(ValidationError::IdMismatch);
    }

    if !event.verify_sig() {
        return Err(ValidationError::BadSignature);
    }

    if StorageClass::of(event.kind).is_none() {
        return Err(ValidationError::KindOutOfRange(event.kind));
    }

    let allowed_ns = policy.max_future_skew_secs.saturating_mul(NANOS_PER_SEC);
    if event.created_at > now_ns.saturating_add(allowed_ns) {
        return Err(ValidationError::TimestampOutOfRange {
            skew_ns: event.created_at - now_ns,
            allowed_ns,
        });
    }

    if policy.pow_difficulty > 0 {
        let got = pow::leading_zero_bits(event.event_id.as_bytes());
        if got < policy.pow_difficulty {
            return Err(ValidationError::InsufficientPow {
                got,
                need: policy.pow_difficulty,
            });
        }
    }

    if !limits.check_publish(event.pubkey.as_bytes()) {
        return Err(ValidationError::RateLimited);
    }

    Ok(())
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_types::{EventId, Sig, Tag};

    fn policy() -> ValidationConfig {
        ValidationConfig::default()
    }

    fn no_limits() -> RateLimits {
        RateLimits::new(&policy())
    }

    #[test]
    fn signed_event_is_accepted() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "hello");
        assert!(validate_event(&event, &policy(), &no_limits(), 100).is_ok());
    }

    #[test]
    fn id_mismatch_is_rejected_before_signature() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "hello");
        let forged = Event {
            event_id: EventId::from_bytes([0xFF; 32]),
            ..event
        };
        assert_eq!(
            validate_event(&forged, &policy(), &no_limits(), 100),
            Err(ValidationError::IdMismatch)
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "hello");
        let mut sig = *event.sig.as_bytes();
        sig[0] ^= 0x01;
        let forged = Event {
            sig: Sig::from_bytes(sig),
            ..event
        };
        assert_eq!(
            validate_event(&forged, &policy(), &no_limits(), 100),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        for kind in [1000, 5000, 40_000, u16::MAX] {
            let event = Event::signed(&[1u8; 32], kind, 1, vec![], "");
            assert_eq!(
                validate_event(&event, &policy(), &no_limits(), 100),
                Err(ValidationError::KindOutOfRange(kind))
            );
        }
    }

    #[test]
    fn future_timestamp_beyond_skew_is_rejected() {
        let now = 1_000_000_000_000u64;
        let allowed = 60 * NANOS_PER_SEC;
        let inside = Event::signed(&[1u8; 32], 1, now + allowed, vec![], "");
        assert!(validate_event(&inside, &policy(), &no_limits(), now).is_ok());
        let outside = Event::signed(&[1u8; 32], 1, now + allowed + 1, vec![], "");
        assert!(matches!(
            validate_event(&outside, &policy(), &no_limits(), now),
            Err(ValidationError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn no_lower_bound_on_created_at() {
        let ancient = Event::signed(&[1u8; 32], 1, 0, vec![], "");
        assert!(validate_event(&ancient, &policy(), &no_limits(), u64::MAX / 2).is_ok());
    }

    #[test]
    fn structural_failure_is_rejected_first() {
        let event = Event::signed(
            &[1u8; 32],
            1,
            1,
            vec![Tag::new("bad key!", vec!["v".into()])],
            "",
        );
        assert!(matches!(
            validate_event(&event, &policy(), &no_limits(), 100),
            Err(ValidationError::Structure(_))
        ));
    }

    #[test]
    fn oversized_event_is_rejected() {
        let mut policy = policy();
        policy.max_event_size_bytes = Some(160);
        // canonical bytes: 32 pubkey + 8 created_at + 2 kind + 2 tag
        // count + content, plus 96 for id and sig
        let small = Event::signed(&[1u8; 32], 1, 1, vec![], "ok");
        assert_eq!(small.wire_size(), 142);
        assert!(validate_event(&small, &policy, &no_limits(), 100).is_ok());

        let big = Event::signed(&[1u8; 32], 1, 1, vec![], "x".repeat(64));
        assert_eq!(
            validate_event(&big, &policy, &no_limits(), 100),
            Err(ValidationError::EventTooLarge {
                size: big.wire_size(),
                max: 160
            })
        );
    }

    #[test]
    fn no_size_limit_by_default() {
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "x".repeat(4096));
        assert!(validate_event(&event, &policy(), &no_limits(), 100).is_ok());
    }

    #[test]
    fn pow_difficulty_is_enforced() {
        let mut policy = policy();
        policy.pow_difficulty = 4;
        // Mine a nonce tag until the id carries 4 leading zero bits.
        let mined = (0u64..)
            .map(|nonce| {
                Event::signed(
                    &[1u8; 32],
                    1,
                    1,
                    vec![Tag::new("nonce", vec![nonce.to_string()])],
                    "",
                )
            })
            .find(|ev| pow::leading_zero_bits(ev.event_id.as_bytes()) >= 4)
            .unwrap();
        assert!(validate_event(&mined, &policy, &no_limits(), 100).is_ok());

        let unmined = (0u64..)
            .map(|nonce| {
                Event::signed(
                    &[1u8; 32],
                    1,
                    1,
                    vec![Tag::new("nonce", vec![nonce.to_string()])],
                    "",
                )
            })
            .find(|ev| pow::leading_zero_bits(ev.event_id.as_bytes()) < 4)
            .unwrap();
        assert!(matches!(
            validate_event(&unmined, &policy, &no_limits(), 100),
            Err(ValidationError::InsufficientPow { .. })
        ));
    }

    #[test]
    fn rate_limit_applies_after_validity() {
        let mut policy = policy();
        policy.publishes_per_minute = 2;
        let limits = RateLimits::new(&policy);
        let event = Event::signed(&[1u8; 32], 1, 1, vec![], "x");
        assert!(validate_event(&event, &policy, &limits, 100).is_ok());
        assert!(validate_event(&event, &policy, &limits, 100).is_ok());
        assert_eq!(
            validate_event(&event, &policy, &limits, 100),
            Err(ValidationError::RateLimited)
        );
    }
}
