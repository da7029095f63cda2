//! # Topic Log
//!
//! A durable, offset-indexed topic log: producers append messages,
//! consumers read them by historical offset or block ("long-poll") until
//! new data arrives, and the oldest messages can be discarded by
//! truncation.
//!
//! ## Core Concepts
//!
//! - **Topics**: independent append-only logs identified by name, each
//!   with a `head` (smallest valid offset) and `tail` (one past the last
//!   message)
//! - **Pull**: reads `[offset, tail)` immediately when data exists, or
//!   parks at the live edge until a publish arrives, bounded by a timeout
//! - **Truncate**: advances `head`, rejecting readers left below it
//! - **Journal**: per-topic write-ahead file replayed on open, so state
//!   survives restarts
//!
//! ## Example
//!
//! ```ignore
//! use tailq::{Broker, BrokerConfig, MessageInput};
//!
//! let broker = Broker::open_or_create(BrokerConfig {
//!     path: "./my-broker".into(),
//!     ..Default::default()
//! })?;
//!
//! // Publish a message
//! broker.publish("orders", MessageInput::json(&json!({
//!     "sku": "A-17"
//! }))?)?;
//!
//! // Read it back
//! let batch = broker.pull("orders", Some(tailq::Offset(0)))?;
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod journal;
pub mod topic;
pub mod types;

// Re-exports
pub use broker::{Broker, BrokerConfig};
pub use client::{CancelToken, ClientConfig, EventFrame, EventStream, LongPollClient, KEEP_ALIVE_LINE};
pub use error::{Result, TopicError};
pub use journal::{JournalEntry, TopicJournal};
pub use topic::{Topic, TopicConfig, TopicState};
pub use types::*;
