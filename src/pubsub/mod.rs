//! Fan-out of ledger notifications.
//!
//! The ingestion core publishes [`LedgerEvent`]s on an in-process
//! [`EventBus`] and never waits on consumers. The Redpanda forwarder is one
//! such consumer, relaying events to Kafka-compatible topics for the
//! dashboard layer.

mod bus;
mod redpanda;

pub use bus::{EventBus, LedgerEvent, TokenBalance};
pub use redpanda::RedpandaPublisher;
