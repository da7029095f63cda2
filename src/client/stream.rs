//! Line-framed event stream over a long-poll loop.

use crate::error::TopicError;
use crate::types::{Message, PayloadEncoding};
use serde::{Deserialize, Serialize};

use super::poll::LongPollClient;

/// The keep-alive line emitted before any data, so transports with idle
/// timeouts see bytes immediately.
pub const KEEP_ALIVE_LINE: &str = ": keep-alive";

/// One message rendered as a self-describing JSON frame.
///
/// JSON payloads are embedded verbatim; MessagePack payloads are
/// transcoded to JSON; raw payloads are carried hex-encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFrame {
    pub offset: u64,
    pub timestamp: i64,
    pub payload_size: usize,
    /// Structured payload, when the encoding allows it.
    pub payload: Option<serde_json::Value>,
    /// Hex-encoded bytes for raw (or undecodable) payloads.
    pub payload_hex: Option<String>,
}

impl EventFrame {
    pub fn from_message(message: &Message) -> Self {
        let decoded: Option<serde_json::Value> = match message.encoding {
            PayloadEncoding::Json => serde_json::from_slice(&message.payload).ok(),
            PayloadEncoding::MessagePack => rmp_serde::from_slice(&message.payload).ok(),
            PayloadEncoding::Raw => None,
        };
        let payload_hex = if decoded.is_none() {
            Some(hex::encode(&message.payload))
        } else {
            None
        };

        Self {
            offset: message.offset.0,
            timestamp: message.timestamp.0,
            payload_size: message.payload.len(),
            payload: decoded,
            payload_hex,
        }
    }
}

/// Wraps a [`LongPollClient`] as a line-oriented event stream: a
/// keep-alive line first, then one `data: <frame>` line per message.
///
/// The stream closes when the loop ends (cancellation) and propagates
/// loop failures as stream errors.
pub struct EventStream {
    client: LongPollClient,
    sent_keep_alive: bool,
    done: bool,
}

impl EventStream {
    pub fn new(client: LongPollClient) -> Self {
        Self {
            client,
            sent_keep_alive: false,
            done: false,
        }
    }

    /// Access the underlying client, e.g. for its cancel token.
    pub fn client(&self) -> &LongPollClient {
        &self.client
    }
}

impl Iterator for EventStream {
    type Item = Result<String, TopicError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.sent_keep_alive {
            self.sent_keep_alive = true;
            return Some(Ok(KEEP_ALIVE_LINE.to_string()));
        }

        match self.client.next() {
            Some(Ok(message)) => {
                let frame = EventFrame::from_message(&message);
                match serde_json::to_string(&frame) {
                    Ok(json) => Some(Ok(format!("data: {}", json))),
                    Err(e) => {
                        self.done = true;
                        Some(Err(e.into()))
                    }
                }
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
