//! Durable per-topic state record.

use crate::error::{Result, TopicError};
use crate::types::{Message, Offset};
use std::collections::BTreeMap;

/// The mutable record for one topic: boundary counters plus the retained
/// messages. Pure data; all behavior (locking, journaling, waiter
/// notification) lives in the owning topic.
///
/// Invariant: `head <= tail`, and `messages` holds entries only for
/// offsets in `[head, tail)`.
#[derive(Debug, Default)]
pub struct TopicState {
    /// Smallest valid offset; everything below has been discarded.
    head: Offset,

    /// One past the last appended message.
    tail: Offset,

    /// Retained messages keyed by offset.
    messages: BTreeMap<u64, Message>,
}

impl TopicState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Offset {
        self.head
    }

    pub fn tail(&self) -> Offset {
        self.tail
    }

    /// Number of physically retained messages.
    pub fn retained(&self) -> u64 {
        self.messages.len() as u64
    }

    /// Messages in `[from, tail)`, in offset order.
    pub fn range(&self, from: Offset) -> Vec<Message> {
        self.messages
            .range(from.0..self.tail.0)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Apply an append. The message must land exactly at the current tail;
    /// anything else means the journal and the state disagree.
    pub fn apply_publish(&mut self, message: Message) -> Result<()> {
        if message.offset != self.tail {
            return Err(TopicError::Corruption(format!(
                "Publish at offset {} but tail is {}",
                message.offset, self.tail
            )));
        }
        self.messages.insert(message.offset.0, message);
        self.tail = self.tail.next();
        Ok(())
    }

    /// Apply a head advance, purging messages that fall below it.
    ///
    /// `new_head` beyond the current tail lifts the tail as well: that shape
    /// only occurs when replaying a compacted journal, where the leading
    /// truncate marker re-establishes both boundaries of an empty range.
    pub fn apply_truncate(&mut self, new_head: Offset) {
        if new_head <= self.head {
            return;
        }
        self.head = new_head;
        if new_head > self.tail {
            self.tail = new_head;
        }
        // BTreeMap::retain would scan everything; split_off keeps the
        // surviving suffix in one step.
        self.messages = self.messages.split_off(&new_head.0);
    }
}
