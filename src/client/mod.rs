//! Consumer-side long-poll loop and its derived event stream.
//!
//! The topic actor never retries; this module holds all retry policy:
//! timeouts are slept through and re-issued with the same offset,
//! truncated history is a terminal failure, and an external cancel token
//! stops the loop without error.
//!
//! # Example
//!
//! ```ignore
//! let client = LongPollClient::new(broker.topic("orders")?);
//! let token = client.cancel_token();
//!
//! for line in EventStream::new(client) {
//!     println!("{}", line?);
//! }
//! ```

mod poll;
mod stream;

pub use poll::{CancelToken, ClientConfig, LongPollClient};
pub use stream::{EventFrame, EventStream, KEEP_ALIVE_LINE};
