//! Pending long-poll waiters attached to a topic.

use crate::types::{Offset, PullBatch, WaiterId};
use crossbeam_channel::Sender;

use super::state::TopicState;

/// What a parked puller eventually hears back.
#[derive(Clone, Debug)]
pub(crate) enum WaiterSignal {
    /// The tail passed the waiter's offset; here is everything from it.
    Resolved(PullBatch),

    /// The head passed the waiter's offset; the requested history is gone.
    Rejected { offset: Offset, head: Offset },

    /// The topic was torn down while the waiter was parked.
    Closed(String),
}

/// One registered waiter: the requested read position and the completion
/// channel its pull call is parked on.
struct Waiter {
    id: WaiterId,
    offset: Offset,
    sender: Sender<WaiterSignal>,
}

impl Waiter {
    /// Deliver the signal. A send to a waiter whose pull already timed out
    /// hits a dropped receiver; that late resolution is a benign no-op.
    fn notify(&self, signal: WaiterSignal) {
        let _ = self.sender.try_send(signal);
    }
}

/// Ordered registry of pending waiters for one topic.
///
/// Not internally synchronized; the owning topic mutates it only while
/// holding its exclusive lock, which is what makes registration race-free
/// against publish and truncate.
#[derive(Default)]
pub(crate) struct NotificationRegistry {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter at `offset`. Returns its id for later removal.
    pub fn register(&mut self, offset: Offset, sender: Sender<WaiterSignal>) -> WaiterId {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.waiters.push(Waiter { id, offset, sender });
        id
    }

    /// Remove a waiter, e.g. after its pull timed out. Returns whether it
    /// was still registered.
    pub fn remove(&mut self, id: WaiterId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Number of pending waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve every waiter whose offset now lies below the tail, in
    /// registration order. Waiters at or past the tail stay parked.
    pub fn resolve_ready(&mut self, state: &TopicState) {
        let tail = state.tail();
        self.waiters.retain(|waiter| {
            if waiter.offset < tail {
                waiter.notify(WaiterSignal::Resolved(PullBatch {
                    messages: state.range(waiter.offset),
                    next_offset: tail,
                }));
                false
            } else {
                true
            }
        });
    }

    /// Reject every waiter whose offset fell below the new head. Waiters at
    /// or above it remain pending; truncation never resolves a waiter.
    pub fn reject_below(&mut self, new_head: Offset) {
        self.waiters.retain(|waiter| {
            if waiter.offset < new_head {
                waiter.notify(WaiterSignal::Rejected {
                    offset: waiter.offset,
                    head: new_head,
                });
                false
            } else {
                true
            }
        });
    }

    /// Reject everything on topic teardown.
    pub fn close_all(&mut self, topic: &str) {
        for waiter in self.waiters.drain(..) {
            waiter.notify(WaiterSignal::Closed(topic.to_string()));
        }
    }
}
