//! # aether-types
//!
//! Shared types for the Aether relay: the signed, content-addressed event
//! model, subscription filters, and the wire envelopes spoken by every
//! relay surface.
//!
//! Events are named by the BLAKE3 hash of their canonical serialization
//! and signed with Ed25519. The 16-bit `kind` selects the storage class:
//!
//! | range        | class                       |
//! |--------------|-----------------------------|
//! | 0..=999      | immutable                   |
//! | 10000..=19999| replaceable                 |
//! | 20000..=29999| ephemeral                   |
//! | 30000..=39999| parameterized replaceable   |
//!
//! Everything outside those ranges is rejected at validation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod messages;
pub mod wire;

pub use error::{EventError, FilterError, IdError, WireError};
pub use event::{Event, StorageClass, Tag};
pub use filter::Filter;
pub use ids::{EventId, Pubkey, Sig};
pub use messages::{
    Ack, ErrorFrame, EventFrame, Hello, Message, NoiseFrame, NoiseInfo, Publish, Subscribe,
    Unsubscribe, Welcome,
};
pub use wire::{decode, encode, WireFormat};
