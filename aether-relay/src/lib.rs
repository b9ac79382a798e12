//! # aether-relay
//!
//! The Aether relay core: accepts signed, content-addressed events,
//! validates them, applies kind-range storage semantics, and fans out to
//! matching live subscriptions over several wire surfaces.
//!
//! ## Architecture
//!
//! ```text
//!   native WS        NIP-01 WS       HTTP / SSE / JSON WS
//!       │                │                   │
//!       └───────┬────────┴─────────┬─────────┘
//!               │     gateways     │
//!        ┌──────┴──────────────────┴──────┐
//!        │             Relay              │
//!        │  validate → store → dispatch   │
//!        │  ┌──────────┐  ┌────────────┐  │
//!        │  │ EventStore│ │ Registry + │  │
//!        │  │ mem/sqlite│ │  outboxes  │  │
//!        │  └──────────┘  └────────────┘  │
//!        └────────────────────────────────┘
//! ```
//!
//! Every surface normalizes to the same [`aether_types::Event`] and shares
//! one store, so an event accepted anywhere is dispatchable everywhere.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateways;
pub mod limits;
pub mod metrics;
pub mod noise;
pub mod pow;
pub mod relay;
pub mod session;
pub mod store;
pub mod validation;

pub use config::Config;
pub use relay::{PublishStatus, Relay};
