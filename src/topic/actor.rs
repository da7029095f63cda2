//! The behavioral core of one topic: publish, pull, truncate.

use crate::error::{Result, TopicError};
use crate::journal::{JournalEntry, TopicJournal};
use crate::types::{Message, MessageInput, Offset, PullBatch, Timestamp, TopicStats, WaiterId};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use super::state::TopicState;
use super::waiters::{NotificationRegistry, WaiterSignal};

/// Per-topic configuration.
#[derive(Clone, Debug)]
pub struct TopicConfig {
    /// How long a pull at the live edge waits before failing with
    /// `PullTimeout`.
    pub pull_timeout: Duration,

    /// Capacity of the publish dedup-key cache.
    pub dedup_cache_size: usize,

    /// Journal sync interval (writes between fsyncs; 0 = every write).
    pub sync_interval: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_secs(30),
            dedup_cache_size: 1024,
            sync_interval: TopicJournal::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Everything a mutating operation touches, behind one lock.
///
/// Holding the write lock across journal append, state mutation, and
/// waiter notification is the single-writer discipline that makes waiter
/// registration race-free: no publish or truncate can interleave with the
/// three-way check in `subscribe`.
struct TopicInner {
    state: TopicState,
    waiters: NotificationRegistry,
    journal: TopicJournal,
    dedup: LruCache<String, Offset>,
}

/// Outcome of the internal registration step.
enum SubscribeOutcome {
    /// Data arrived between the caller's snapshot and registration.
    Ready(PullBatch),
    /// Parked; the id allows best-effort removal after a timeout.
    Registered(WaiterId),
}

/// A durable, offset-indexed topic log.
///
/// Producers `publish`, consumers `pull` by offset or block at the live
/// edge, and `truncate` discards the oldest messages. Each topic is an
/// independent unit of sequential consistency: mutations are serialized
/// behind a write lock, while the non-suspending pull fast path reads a
/// consistent snapshot under the shared lock.
pub struct Topic {
    name: String,
    config: TopicConfig,
    inner: RwLock<TopicInner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Topic {
    /// Open a topic backed by the journal at `path`, replaying any
    /// existing entries.
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        config: TopicConfig,
    ) -> Result<Self> {
        let name = name.into();
        let (journal, entries) = TopicJournal::open(path, config.sync_interval)?;

        let mut state = TopicState::new();
        let mut dedup = LruCache::new(
            NonZeroUsize::new(config.dedup_cache_size).unwrap_or(NonZeroUsize::MIN),
        );

        for entry in entries {
            match entry {
                JournalEntry::Publish { message, dedup: key } => {
                    let offset = message.offset;
                    state.apply_publish(message)?;
                    if let Some(key) = key {
                        dedup.put(key, offset);
                    }
                }
                JournalEntry::Truncate { new_head } => {
                    state.apply_truncate(new_head);
                }
            }
        }

        debug!(
            topic = %name,
            head = state.head().0,
            tail = state.tail().0,
            "opened topic"
        );

        Ok(Self {
            name,
            config,
            inner: RwLock::new(TopicInner {
                state,
                waiters: NotificationRegistry::new(),
                journal,
                dedup,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // --- Pull ---

    /// Read messages starting at `offset`, or from the current tail when
    /// `offset` is `None`, using the configured pull timeout.
    ///
    /// Returns immediately when data at `offset` already exists; otherwise
    /// parks until a publish carries the tail past the requested position.
    pub fn pull(&self, offset: Option<Offset>) -> Result<PullBatch> {
        self.pull_with_timeout(offset, self.config.pull_timeout)
    }

    /// `pull` with an explicit bound on the wait.
    pub fn pull_with_timeout(&self, offset: Option<Offset>, timeout: Duration) -> Result<PullBatch> {
        self.check_open()?;

        // Fast path: a shared-lock snapshot. Only a concrete offset can be
        // satisfied here; "from the current tail" always parks.
        if let Some(at) = offset {
            let inner = self.inner.read();
            if at < inner.state.head() {
                return Err(TopicError::OffsetBelowHead {
                    offset: at,
                    head: inner.state.head(),
                });
            }
            if at < inner.state.tail() {
                return Ok(PullBatch {
                    messages: inner.state.range(at),
                    next_offset: inner.state.tail(),
                });
            }
        }

        // At (or past) the live edge: register a waiter and park. The
        // waiter holds the read lock for none of the wait, so publishes
        // and truncates proceed while this call is suspended.
        let (sender, receiver) = bounded(1);
        let id = match self.subscribe(offset, sender)? {
            SubscribeOutcome::Ready(batch) => return Ok(batch),
            SubscribeOutcome::Registered(id) => id,
        };

        match receiver.recv_timeout(timeout) {
            Ok(WaiterSignal::Resolved(batch)) => Ok(batch),
            Ok(WaiterSignal::Rejected { offset, head }) => {
                Err(TopicError::OffsetBelowHead { offset, head })
            }
            Ok(WaiterSignal::Closed(name)) => Err(TopicError::TopicClosed(name)),
            Err(RecvTimeoutError::Timeout) => {
                // Best-effort removal; if a publish resolved the waiter in
                // the meantime the resolution lands in a dropped channel.
                self.inner.write().waiters.remove(id);
                Err(TopicError::PullTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(TopicError::TopicClosed(self.name.clone()))
            }
        }
    }

    /// Register a waiter for `offset` (current tail when `None`).
    ///
    /// The three-way check runs under the write lock, mutually exclusive
    /// with publish and truncate, so no window exists where data lands
    /// after the caller's snapshot yet the waiter misses the notification.
    fn subscribe(
        &self,
        offset: Option<Offset>,
        sender: Sender<WaiterSignal>,
    ) -> Result<SubscribeOutcome> {
        let mut inner = self.inner.write();
        // Re-check under the lock: a close between the caller's snapshot
        // and this registration must not leave a waiter nobody will wake.
        self.check_open()?;
        let at = offset.unwrap_or_else(|| inner.state.tail());

        if at < inner.state.head() {
            return Err(TopicError::OffsetBelowHead {
                offset: at,
                head: inner.state.head(),
            });
        }
        if at < inner.state.tail() {
            return Ok(SubscribeOutcome::Ready(PullBatch {
                messages: inner.state.range(at),
                next_offset: inner.state.tail(),
            }));
        }

        let id = inner.waiters.register(at, sender);
        trace!(topic = %self.name, offset = at.0, "registered waiter");
        Ok(SubscribeOutcome::Registered(id))
    }

    // --- Publish ---

    /// Append a message. Returns the offset it was assigned.
    pub fn publish(&self, input: MessageInput) -> Result<Offset> {
        self.publish_inner(input, None)
    }

    /// Append a message with a deduplication key: a retried publish
    /// carrying a recently seen key returns the prior offset instead of
    /// appending again.
    pub fn publish_with_dedup(&self, input: MessageInput, dedup_key: &str) -> Result<Offset> {
        self.publish_inner(input, Some(dedup_key))
    }

    fn publish_inner(&self, input: MessageInput, dedup_key: Option<&str>) -> Result<Offset> {
        self.check_open()?;

        let mut inner = self.inner.write();
        self.check_open()?;
        let TopicInner {
            state,
            waiters,
            journal,
            dedup,
        } = &mut *inner;

        if let Some(key) = dedup_key {
            if let Some(&prior) = dedup.get(key) {
                trace!(topic = %self.name, key, offset = prior.0, "duplicate publish");
                return Ok(prior);
            }
        }

        let message = Message {
            offset: state.tail(),
            timestamp: Timestamp::now(),
            payload: input.payload,
            encoding: input.encoding,
        };

        // Journal first: the append must be durable before anyone is told
        // about it.
        journal.append_publish(&message, dedup_key)?;

        let offset = message.offset;
        state.apply_publish(message)?;
        if let Some(key) = dedup_key {
            dedup.put(key.to_string(), offset);
        }

        waiters.resolve_ready(state);

        trace!(topic = %self.name, offset = offset.0, "published");
        Ok(offset)
    }

    // --- Truncate ---

    /// Discard the oldest `count` messages. The head never advances past
    /// the tail: truncating more than is available truncates everything
    /// currently published, not future messages.
    ///
    /// Returns the new head.
    pub fn truncate(&self, count: u64) -> Result<Offset> {
        self.check_open()?;

        let mut inner = self.inner.write();
        self.check_open()?;
        let TopicInner {
            state,
            waiters,
            journal,
            ..
        } = &mut *inner;

        let new_head = state.head().advance(count).min(state.tail());
        if new_head == state.head() {
            return Ok(new_head);
        }

        journal.append_truncate(new_head)?;
        state.apply_truncate(new_head);
        waiters.reject_below(new_head);

        debug!(topic = %self.name, head = new_head.0, "truncated");
        Ok(new_head)
    }

    // --- Maintenance ---

    /// Current counters.
    pub fn stats(&self) -> TopicStats {
        let inner = self.inner.read();
        TopicStats {
            head: inner.state.head().0,
            tail: inner.state.tail().0,
            retained: inner.state.retained(),
            pending_waiters: inner.waiters.len(),
        }
    }

    /// Force-sync the journal to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.write().journal.sync()
    }

    /// Rewrite the journal down to the retained window `[head, tail)`.
    ///
    /// Frees the space held by truncated entries; visible state is
    /// unchanged. Dedup keys recorded before the compaction point are not
    /// carried over.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let TopicInner { state, journal, .. } = &mut *inner;

        let mut entries = Vec::with_capacity(state.retained() as usize + 1);
        entries.push(JournalEntry::Truncate {
            new_head: state.head(),
        });
        for message in state.range(state.head()) {
            entries.push(JournalEntry::Publish {
                message,
                dedup: None,
            });
        }

        journal.rewrite(&entries)?;
        debug!(topic = %self.name, size = journal.size(), "compacted journal");
        Ok(())
    }

    /// Tear the topic down: wake every parked puller with `TopicClosed`
    /// and refuse further operations.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.write();
        inner.waiters.close_all(&self.name);
        let _ = inner.journal.sync();
        debug!(topic = %self.name, "closed topic");
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TopicError::TopicClosed(self.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn test_topic(dir: &TempDir) -> Topic {
        Topic::open("test", dir.path().join("test.log"), TopicConfig::default()).unwrap()
    }

    fn publish_raw(topic: &Topic, payload: &[u8]) -> Offset {
        topic.publish(MessageInput::raw(payload.to_vec())).unwrap()
    }

    #[test]
    fn test_publish_assigns_dense_offsets() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);

        assert_eq!(publish_raw(&topic, b"a"), Offset(0));
        assert_eq!(publish_raw(&topic, b"b"), Offset(1));
        assert_eq!(publish_raw(&topic, b"c"), Offset(2));

        let stats = topic.stats();
        assert_eq!(stats.head, 0);
        assert_eq!(stats.tail, 3);
    }

    #[test]
    fn test_pull_historical_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        publish_raw(&topic, b"a");
        publish_raw(&topic, b"b");

        let batch = topic.pull(Some(Offset(0))).unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].payload, b"a");
        assert_eq!(batch.messages[1].payload, b"b");
        assert_eq!(batch.next_offset, Offset(2));

        let batch = topic.pull(Some(Offset(1))).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].payload, b"b");
    }

    #[test]
    fn test_pull_below_head_fails() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        publish_raw(&topic, b"a");
        publish_raw(&topic, b"b");
        topic.truncate(1).unwrap();

        let err = topic.pull(Some(Offset(0))).unwrap_err();
        match err {
            TopicError::OffsetBelowHead { offset, head } => {
                assert_eq!(offset, Offset(0));
                assert_eq!(head, Offset(1));
            }
            other => panic!("Expected OffsetBelowHead, got {:?}", other),
        }

        // The surviving offset still reads fine.
        let batch = topic.pull(Some(Offset(1))).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.next_offset, Offset(2));
    }

    #[test]
    fn test_pull_at_tail_times_out() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        publish_raw(&topic, b"a");

        let err = topic
            .pull_with_timeout(Some(Offset(1)), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TopicError::PullTimeout));
        assert!(err.is_retryable());

        // The timed-out waiter was removed.
        assert_eq!(topic.stats().pending_waiters, 0);
    }

    #[test]
    fn test_pull_wakes_on_publish() {
        let dir = TempDir::new().unwrap();
        let topic = Arc::new(test_topic(&dir));

        let reader = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || topic.pull_with_timeout(None, Duration::from_secs(5)))
        };

        // Give the reader time to park.
        while topic.stats().pending_waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        publish_raw(&topic, b"x");

        let batch = reader.join().unwrap().unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].payload, b"x");
        assert_eq!(batch.next_offset, Offset(1));
    }

    #[test]
    fn test_pull_past_tail_waits_for_tail_to_reach_it() {
        let dir = TempDir::new().unwrap();
        let topic = Arc::new(test_topic(&dir));

        // Waiter at offset 2 on an empty topic.
        let reader = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || topic.pull_with_timeout(Some(Offset(2)), Duration::from_secs(5)))
        };
        while topic.stats().pending_waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        // One publish moves tail to 1; the waiter must stay parked.
        publish_raw(&topic, b"a");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(topic.stats().pending_waiters, 1);

        publish_raw(&topic, b"b");
        publish_raw(&topic, b"c");

        let batch = reader.join().unwrap().unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].payload, b"c");
        assert_eq!(batch.next_offset, Offset(3));
    }

    #[test]
    fn test_truncate_caps_at_tail() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        for payload in [b"a", b"b", b"c"] {
            publish_raw(&topic, payload);
        }

        let head = topic.truncate(100).unwrap();
        assert_eq!(head, Offset(3));

        let stats = topic.stats();
        assert_eq!(stats.head, 3);
        assert_eq!(stats.tail, 3);
        assert_eq!(stats.retained, 0);

        // Future messages are untouched by the earlier over-truncation.
        assert_eq!(publish_raw(&topic, b"d"), Offset(3));
        let batch = topic.pull(Some(Offset(3))).unwrap();
        assert_eq!(batch.messages.len(), 1);
    }

    #[test]
    fn test_truncate_spares_waiter_ahead_of_new_head() {
        let dir = TempDir::new().unwrap();
        let topic = Arc::new(test_topic(&dir));
        publish_raw(&topic, b"a");
        publish_raw(&topic, b"b");

        // Waiter far ahead of the tail, at offset 5.
        let ahead = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || topic.pull_with_timeout(Some(Offset(5)), Duration::from_secs(5)))
        };
        while topic.stats().pending_waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        // Truncating everything (head = tail = 2) must leave the waiter
        // pending: truncation never resolves, and 5 >= new head.
        topic.truncate(100).unwrap();
        assert_eq!(topic.stats().pending_waiters, 1);

        // Tail reaching 5 is still not enough; it resolves once tail
        // passes the requested offset.
        for payload in [b"c", b"d", b"e"] {
            publish_raw(&topic, payload);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(topic.stats().pending_waiters, 1);

        publish_raw(&topic, b"f");
        let batch = ahead.join().unwrap().unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].payload, b"f");
        assert_eq!(batch.next_offset, Offset(6));
    }

    #[test]
    fn test_subscribe_below_head_rejects_immediately() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        publish_raw(&topic, b"a");
        publish_raw(&topic, b"b");
        topic.truncate(2).unwrap();

        // Offset 0 is below head even though nothing is retained; the
        // failure is immediate, not a timeout.
        let started = std::time::Instant::now();
        let err = topic
            .pull_with_timeout(Some(Offset(0)), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TopicError::OffsetBelowHead { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dedup_key_returns_prior_offset() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);

        let first = topic
            .publish_with_dedup(MessageInput::raw(b"once".to_vec()), "req-1")
            .unwrap();
        let second = topic
            .publish_with_dedup(MessageInput::raw(b"once".to_vec()), "req-1")
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(topic.stats().tail, 1);

        // A different key appends normally.
        let third = topic
            .publish_with_dedup(MessageInput::raw(b"twice".to_vec()), "req-2")
            .unwrap();
        assert_eq!(third, Offset(1));
    }

    #[test]
    fn test_reopen_replays_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.log");

        {
            let topic = Topic::open("test", &path, TopicConfig::default()).unwrap();
            publish_raw(&topic, b"a");
            publish_raw(&topic, b"b");
            topic.truncate(1).unwrap();
            topic.sync().unwrap();
        }

        let topic = Topic::open("test", &path, TopicConfig::default()).unwrap();
        let stats = topic.stats();
        assert_eq!(stats.head, 1);
        assert_eq!(stats.tail, 2);

        let batch = topic.pull(Some(Offset(1))).unwrap();
        assert_eq!(batch.messages[0].payload, b"b");

        // Dedup cache survives the restart too.
        let dir2 = TempDir::new().unwrap();
        let path2 = dir2.path().join("d.log");
        {
            let topic = Topic::open("d", &path2, TopicConfig::default()).unwrap();
            topic
                .publish_with_dedup(MessageInput::raw(b"x".to_vec()), "key")
                .unwrap();
            topic.sync().unwrap();
        }
        let topic = Topic::open("d", &path2, TopicConfig::default()).unwrap();
        let offset = topic
            .publish_with_dedup(MessageInput::raw(b"x".to_vec()), "key")
            .unwrap();
        assert_eq!(offset, Offset(0));
        assert_eq!(topic.stats().tail, 1);
    }

    #[test]
    fn test_compact_preserves_visible_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.log");

        {
            let topic = Topic::open("test", &path, TopicConfig::default()).unwrap();
            for i in 0..10u32 {
                topic
                    .publish(MessageInput::raw(format!("m{}", i).into_bytes()))
                    .unwrap();
            }
            topic.truncate(7).unwrap();
            topic.compact().unwrap();

            let batch = topic.pull(Some(Offset(7))).unwrap();
            assert_eq!(batch.messages.len(), 3);
        }

        let topic = Topic::open("test", &path, TopicConfig::default()).unwrap();
        let stats = topic.stats();
        assert_eq!(stats.head, 7);
        assert_eq!(stats.tail, 10);
        assert_eq!(stats.retained, 3);
    }

    #[test]
    fn test_close_wakes_parked_pullers() {
        let dir = TempDir::new().unwrap();
        let topic = Arc::new(test_topic(&dir));

        let reader = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || topic.pull_with_timeout(None, Duration::from_secs(5)))
        };
        while topic.stats().pending_waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        topic.close();
        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(err, TopicError::TopicClosed(_)));

        let err = topic.publish(MessageInput::raw(b"x".to_vec())).unwrap_err();
        assert!(matches!(err, TopicError::TopicClosed(_)));
    }
}
