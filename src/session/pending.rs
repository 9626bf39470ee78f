use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::MessageId;

/// The request kinds that are answered by a correlated REPLY
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestKind {
    Auth,
    Join,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReplyOutcome {
    pub ok: bool,
    pub content: String,
}

struct PendingRequest {
    kind: RequestKind,
    reply_sender: oneshot::Sender<ReplyOutcome>,
}

/// Correlates outstanding requests with their replies by message id.
///
/// The protocol allows at most one outstanding request per session, and the table enforces
///  that: registering a second request while one is live fails.
#[derive(Default)]
pub struct PendingReplies {
    requests: FxHashMap<MessageId, PendingRequest>,
}

impl PendingReplies {
    pub fn register(&mut self, id: MessageId, kind: RequestKind) -> anyhow::Result<oneshot::Receiver<ReplyOutcome>> {
        if let Some(existing) = self.requests.keys().next() {
            anyhow::bail!("request #{} is still waiting for its reply", existing);
        }

        let (reply_sender, reply_receiver) = oneshot::channel();
        self.requests.insert(id, PendingRequest { kind, reply_sender });
        Ok(reply_receiver)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Removes the request `ref_id` and hands back its kind and the signal to wake its caller.
    ///  `None` if no such request is pending.
    #[must_use]
    pub fn take(&mut self, ref_id: MessageId) -> Option<(RequestKind, ReplyHandle)> {
        self.requests.remove(&ref_id)
            .map(|r| (r.kind, ReplyHandle(r.reply_sender)))
    }

    /// Removes whichever request is pending, for transports without reply correlation ids
    #[must_use]
    pub fn take_single(&mut self) -> Option<(RequestKind, ReplyHandle)> {
        let id = *self.requests.keys().next()?;
        self.take(id)
    }

    /// Drops all requests. Callers waiting for a reply see the session as closed.
    pub fn clear(&mut self) {
        if !self.requests.is_empty() {
            debug!("discarding {} pending request(s)", self.requests.len());
        }
        self.requests.clear();
    }
}

/// wakes the caller waiting for a reply
pub struct ReplyHandle(oneshot::Sender<ReplyOutcome>);
impl ReplyHandle {
    pub fn resolve(self, outcome: ReplyOutcome) {
        if self.0.send(outcome).is_err() {
            debug!("reply arrived after its caller stopped waiting");
        }
    }
}
