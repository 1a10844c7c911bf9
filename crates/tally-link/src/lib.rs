//! tally-link: bank-account linking and data-sync core for Tally.
//!
//! Orchestrates the multi-step handshake with the external account
//! aggregator (mint link token, UI widget, public-token exchange), persists
//! the resulting credential encrypted at rest, and serves balance and
//! transaction fetches through a serialized, cached, retry-aware pipeline
//! that respects the aggregator's rate limits.
//!
//! The UI, notifications, and the concrete field cipher are collaborators
//! behind traits; nothing in this crate talks to them directly.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod singleflight;
pub mod store;
pub mod throttle;

pub use aggregator::{
    AccountSummary, AggregatorClient, AggregatorError, Balances, DateRange, FailureKind,
    HttpAggregatorClient, HttpAggregatorConfig, TransactionRecord,
};
pub use config::{ChannelLimits, LinkConfig, RetryConfig};
pub use error::LinkError;
pub use orchestrator::{
    ConnectedEvent, LinkMetadata, LinkOrchestrator, LinkPhase, LinkSession,
};
pub use store::{
    Connection, ConnectionStateStore, ConnectionStatus, FieldCipher, JsonFileStore, KeyValueStore,
    MemoryStore, NoopCipher, StatusFlags,
};
pub use throttle::{LinkAttemptThrottle, ThrottleChannel};
