//! Long-poll consumer loop.

use crate::error::TopicError;
use crate::topic::Topic;
use crate::types::{Message, Offset};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::trace;

/// Configuration for a long-poll client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Where to start reading. `None` means "from the current tail", i.e.
    /// only messages published after the first pull are seen.
    pub start_offset: Option<Offset>,

    /// Per-pull wait bound passed to the topic.
    pub pull_timeout: Duration,

    /// Sleep between retries after a pull timeout.
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            start_offset: None,
            pull_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Cancellation flag shared between a client loop and whoever stops it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop. It exits cleanly before its next pull.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A lazy sequence of messages read from a topic by repeated long-polls.
///
/// The client owns the retry policy the topic itself never applies: a
/// `PullTimeout` sleeps and re-issues the pull with the same offset, while
/// `OffsetBelowHead` (the requested history no longer exists) and every
/// other error end the sequence with a terminal failure. Cancellation ends
/// it without error.
pub struct LongPollClient {
    topic: Arc<Topic>,
    config: ClientConfig,
    offset: Option<Offset>,
    buffered: VecDeque<Message>,
    cancel: CancelToken,
    done: bool,
}

impl LongPollClient {
    /// Start a client at the topic's live edge with default timeouts.
    pub fn new(topic: Arc<Topic>) -> Self {
        Self::with_config(topic, ClientConfig::default())
    }

    pub fn with_config(topic: Arc<Topic>, config: ClientConfig) -> Self {
        Self {
            offset: config.start_offset,
            topic,
            config,
            buffered: VecDeque::new(),
            cancel: CancelToken::new(),
            done: false,
        }
    }

    /// Token for stopping this client from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The offset the next pull will request (`None` until the first
    /// successful pull when starting from the live edge).
    pub fn offset(&self) -> Option<Offset> {
        self.offset
    }
}

impl Iterator for LongPollClient {
    type Item = Result<Message, TopicError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Some(Ok(message));
            }
            if self.done || self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            match self
                .topic
                .pull_with_timeout(self.offset, self.config.pull_timeout)
            {
                Ok(batch) => {
                    self.offset = Some(batch.next_offset);
                    self.buffered.extend(batch.messages);
                }
                Err(TopicError::PullTimeout) => {
                    trace!(topic = self.topic.name(), "pull timed out, retrying");
                    thread::sleep(self.config.retry_interval);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::TopicConfig;
    use crate::types::MessageInput;
    use tempfile::TempDir;

    fn test_topic(dir: &TempDir) -> Arc<Topic> {
        Arc::new(Topic::open("test", dir.path().join("test.log"), TopicConfig::default()).unwrap())
    }

    fn quick_config(start_offset: Option<Offset>) -> ClientConfig {
        ClientConfig {
            start_offset,
            pull_timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_yields_history_in_order() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        for i in 0..3u32 {
            topic
                .publish(MessageInput::raw(format!("m{}", i).into_bytes()))
                .unwrap();
        }

        let mut client =
            LongPollClient::with_config(Arc::clone(&topic), quick_config(Some(Offset(0))));

        for i in 0..3u32 {
            let message = client.next().unwrap().unwrap();
            assert_eq!(message.payload, format!("m{}", i).into_bytes());
            assert_eq!(message.offset, Offset(i as u64));
        }
        assert_eq!(client.offset(), Some(Offset(3)));
    }

    #[test]
    fn test_retries_through_timeouts_until_publish() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);

        let publisher = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || {
                // Let the client time out a few times first.
                thread::sleep(Duration::from_millis(200));
                topic.publish(MessageInput::raw(b"late".to_vec())).unwrap();
            })
        };

        let mut client = LongPollClient::with_config(Arc::clone(&topic), quick_config(None));
        let message = client.next().unwrap().unwrap();
        assert_eq!(message.payload, b"late");

        publisher.join().unwrap();
    }

    #[test]
    fn test_truncated_history_is_terminal() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        topic.publish(MessageInput::raw(b"a".to_vec())).unwrap();
        topic.publish(MessageInput::raw(b"b".to_vec())).unwrap();
        topic.truncate(1).unwrap();

        let mut client =
            LongPollClient::with_config(Arc::clone(&topic), quick_config(Some(Offset(0))));

        let err = client.next().unwrap().unwrap_err();
        assert!(matches!(err, TopicError::OffsetBelowHead { .. }));
        assert!(!err.is_retryable());

        // The loop is over after a terminal failure.
        assert!(client.next().is_none());
    }

    #[test]
    fn test_cancellation_stops_without_error() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);

        let mut client = LongPollClient::with_config(Arc::clone(&topic), quick_config(None));
        let token = client.cancel_token();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        });

        assert!(client.next().is_none());
        canceller.join().unwrap();
    }

    #[test]
    fn test_buffered_messages_drain_after_cancel() {
        let dir = TempDir::new().unwrap();
        let topic = test_topic(&dir);
        topic.publish(MessageInput::raw(b"a".to_vec())).unwrap();
        topic.publish(MessageInput::raw(b"b".to_vec())).unwrap();

        let mut client =
            LongPollClient::with_config(Arc::clone(&topic), quick_config(Some(Offset(0))));

        let first = client.next().unwrap().unwrap();
        assert_eq!(first.payload, b"a");

        // The already-pulled message is still delivered; only the next
        // pull is skipped.
        client.cancel_token().cancel();
        let second = client.next().unwrap().unwrap();
        assert_eq!(second.payload, b"b");
        assert!(client.next().is_none());
    }
}
