//! Core types for the topic log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in a topic log.
///
/// Offsets are dense: the first message ever published to a topic has
/// offset 0, the next 1, and so on. Truncation advances the lowest valid
/// offset (`head`) but never renumbers surviving messages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Offset(pub u64);

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Off({})", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Offset {
    pub fn next(self) -> Self {
        Offset(self.0 + 1)
    }

    /// Saturating forward jump, used by truncation.
    pub fn advance(self, count: u64) -> Self {
        Offset(self.0.saturating_add(count))
    }
}

/// Unique identifier for a pending waiter within one topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(pub u64);

impl fmt::Debug for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaiterId({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Json,
    MessagePack,
    Raw,
}

impl Default for PayloadEncoding {
    fn default() -> Self {
        PayloadEncoding::Json
    }
}

/// A single message stored in a topic.
///
/// Payloads are opaque to the log; the encoding tag only matters to
/// consumers (and to the event-stream framing, which embeds JSON payloads
/// verbatim).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Position in the topic (assigned by the topic on publish).
    pub offset: Offset,

    /// When the message was published.
    pub timestamp: Timestamp,

    /// Application-defined payload.
    pub payload: Vec<u8>,

    /// Payload encoding.
    pub encoding: PayloadEncoding,
}

/// Input for publishing a message (before an offset is assigned).
#[derive(Clone, Debug)]
pub struct MessageInput {
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl MessageInput {
    /// Create a message input with a JSON payload.
    pub fn json(payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            payload: serde_json::to_vec(payload)?,
            encoding: PayloadEncoding::Json,
        })
    }

    /// Create a message input with a MessagePack payload.
    pub fn msgpack(payload: &impl Serialize) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            payload: rmp_serde::to_vec(payload)?,
            encoding: PayloadEncoding::MessagePack,
        })
    }

    /// Create a message input with raw bytes.
    pub fn raw(payload: Vec<u8>) -> Self {
        Self {
            payload,
            encoding: PayloadEncoding::Raw,
        }
    }
}

/// Result of a successful pull: a contiguous run of messages and the
/// offset to request next.
#[derive(Clone, Debug)]
pub struct PullBatch {
    /// Messages in offset order, covering `[requested, next_offset)`.
    pub messages: Vec<Message>,

    /// The topic tail at the time the batch was cut.
    pub next_offset: Offset,
}

/// Topic statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopicStats {
    /// Smallest valid offset.
    pub head: u64,
    /// One past the last published offset.
    pub tail: u64,
    /// Messages physically retained (`tail - head` unless compaction lags).
    pub retained: u64,
    /// Waiters currently parked on the topic.
    pub pending_waiters: usize,
}
