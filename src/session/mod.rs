//! The protocol engine: one state machine per connection, driving either the datagram transport
//!  with its confirmation / retransmission / deduplication layer, or the line based stream
//!  transport.

pub mod common;
pub mod datagram;
pub mod output;
pub mod pending;
pub mod state;
pub mod stream;

use async_trait::async_trait;

use crate::error::SessionResult;
use crate::session::pending::ReplyOutcome;


/// The operations a front end performs on a chat session.
///
/// `run_receive_loop` must be running concurrently for requests to complete: it is the receive
///  loop that resolves replies and (on the datagram transport) processes confirmations. At most one
///  request may be outstanding at any time.
#[async_trait]
pub trait Session: Send + Sync {
    /// Dispatches inbound messages until the session ends, returning the process exit code: 0
    ///  for a graceful close, non-zero after a fatal error
    async fn run_receive_loop(&self) -> i32;

    /// Sends AUTH and waits for the correlated reply. Allowed before authentication succeeded,
    ///  i.e. a rejected attempt can be retried.
    async fn authenticate(&self, username: &str, display_name: &str, secret: &str) -> SessionResult<ReplyOutcome>;

    async fn join_channel(&self, channel_id: &str) -> SessionResult<ReplyOutcome>;

    async fn send_chat_message(&self, content: &str) -> SessionResult<()>;

    /// changes the display name used for subsequent messages, without any network traffic
    async fn rename(&self, display_name: &str) -> SessionResult<()>;

    /// Says BYE (if a session was established) and releases the transport. Calling this again
    ///  is a no-op.
    async fn end_session(&self) -> SessionResult<()>;
}
