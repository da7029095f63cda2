//! Per-topic actor: durable state, pending waiters, and the four
//! operations (`pull`, `publish`, `subscribe`, `truncate`).
//!
//! Each topic is an independent unit of sequential consistency. Mutations
//! run one at a time behind the topic's write lock; pulls that can be
//! answered from existing data run under the shared lock; pulls at the
//! live edge park on a completion channel until a publish carries the
//! tail past their offset, bounded by a timeout.
//!
//! # Example
//!
//! ```ignore
//! let topic = Topic::open("orders", "./orders.log", TopicConfig::default())?;
//!
//! topic.publish(MessageInput::json(&json!({"sku": "A-17"}))?)?;
//!
//! // Catch-up read, then block at the live edge.
//! let mut offset = None;
//! loop {
//!     match topic.pull(offset) {
//!         Ok(batch) => {
//!             offset = Some(batch.next_offset);
//!             // handle batch.messages
//!         }
//!         Err(e) if e.is_retryable() => continue,
//!         Err(e) => break,
//!     }
//! }
//! ```

mod actor;
mod state;
mod waiters;

pub use actor::{Topic, TopicConfig};
pub use state::TopicState;
