use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{SessionError, SessionResult, ACTION_AUTH, ACTION_JOIN, ACTION_MSG, ACTION_RENAME};
use crate::message::{validate_channel_id, validate_content, validate_display_name, validate_secret, validate_username, Message, MessageId};
use crate::session::pending::{PendingReplies, ReplyHandle, ReplyOutcome, RequestKind};
use crate::util::recency_set::RecencySet;

/// The connection's finite state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsmState {
    /// no session established yet
    Start,
    /// AUTH was sent, waiting for a positive REPLY. A negative REPLY keeps the session here so
    ///  that authentication can be retried.
    Authenticating,
    /// authenticated: channels can be joined, messages flow
    Open,
    /// terminal, the transport is released
    End,
}

/// Everything a session mutates. There is exactly one instance per connection, shared between the
///  receive loop and the (single) outstanding caller.
pub struct SessionState {
    pub fsm: FsmState,
    pub display_name: String,
    /// `None` once the id space is used up
    next_id: Option<MessageId>,
    /// the text protocol has no message ids, all messages carry 0
    numbered: bool,
    /// ids of received messages that were already handled
    pub received: RecencySet<MessageId>,
    /// ids of sent messages the peer confirmed (datagram transport only)
    pub confirmed: RecencySet<MessageId>,
    /// whether the peer address was switched to the server's dedicated port (datagram transport only)
    pub peer_bound: bool,
    pub pending: PendingReplies,
    terminating: bool,
    exit_code: Option<i32>,
}

pub type ReplyReceiver = oneshot::Receiver<ReplyOutcome>;

impl SessionState {
    pub fn new(recency_capacity: usize, numbered: bool) -> SessionState {
        SessionState {
            fsm: FsmState::Start,
            display_name: String::new(),
            next_id: Some(0),
            numbered,
            received: RecencySet::new(recency_capacity),
            confirmed: RecencySet::new(recency_capacity),
            peer_bound: false,
            pending: PendingReplies::default(),
            terminating: false,
            exit_code: None,
        }
    }

    /// Usage check for a local action: the session must be in one of the `allowed` states and
    ///  must not be shutting down
    pub fn require(&self, action: &'static str, allowed: &[FsmState]) -> SessionResult<()> {
        if self.terminating {
            return Err(SessionError::Closed);
        }
        if !allowed.contains(&self.fsm) {
            return Err(SessionError::WrongState { action, state: self.fsm });
        }
        Ok(())
    }

    /// Usage check for a request that expects a correlated REPLY
    pub fn require_request(&self, action: &'static str, allowed: &[FsmState]) -> SessionResult<()> {
        self.require(action, allowed)?;
        if !self.pending.is_empty() {
            return Err(SessionError::RequestPending { action });
        }
        Ok(())
    }

    /// Hands out the next id for an outbound message. Ids are never reused, so running out of
    ///  them ends the session.
    pub fn next_message_id(&mut self) -> SessionResult<MessageId> {
        if !self.numbered {
            return Ok(0);
        }
        let id = self.next_id.ok_or_else(|| SessionError::Malformed("message id space exhausted".to_string()))?;
        self.next_id = id.checked_add(1);
        Ok(id)
    }

    /// Builds the AUTH message and registers it as the pending request. The display name is
    ///  adopted right away so that it is in place for the messages following a successful reply.
    pub fn begin_auth(&mut self, username: &str, display_name: &str, secret: &str) -> SessionResult<(Message, ReplyReceiver)> {
        self.require_request(ACTION_AUTH, &[FsmState::Start, FsmState::Authenticating])?;
        validate_username(username).map_err(invalid_argument)?;
        validate_display_name(display_name).map_err(invalid_argument)?;
        validate_secret(secret).map_err(invalid_argument)?;

        let id = self.next_message_id()?;
        let reply = self.register(id, RequestKind::Auth, ACTION_AUTH)?;
        if self.fsm == FsmState::Start {
            debug!("Start -> Authenticating");
        }
        self.fsm = FsmState::Authenticating;
        self.display_name = display_name.to_string();

        let msg = Message::Auth {
            id,
            username: username.to_string(),
            display_name: display_name.to_string(),
            secret: secret.to_string(),
        };
        Ok((msg, reply))
    }

    pub fn begin_join(&mut self, channel_id: &str) -> SessionResult<(Message, ReplyReceiver)> {
        self.require_request(ACTION_JOIN, &[FsmState::Open])?;
        validate_channel_id(channel_id).map_err(invalid_argument)?;

        let id = self.next_message_id()?;
        let reply = self.register(id, RequestKind::Join, ACTION_JOIN)?;
        let msg = Message::Join {
            id,
            channel_id: channel_id.to_string(),
            display_name: self.display_name.clone(),
        };
        Ok((msg, reply))
    }

    pub fn begin_chat_message(&mut self, content: &str) -> SessionResult<Message> {
        self.require(ACTION_MSG, &[FsmState::Open])?;
        validate_content(content).map_err(invalid_argument)?;

        Ok(Message::Msg {
            id: self.next_message_id()?,
            display_name: self.display_name.clone(),
            content: content.to_string(),
        })
    }

    pub fn rename(&mut self, display_name: &str) -> SessionResult<()> {
        self.require(ACTION_RENAME, &[FsmState::Open])?;
        validate_display_name(display_name).map_err(invalid_argument)?;

        debug!("renaming {:?} to {:?}", self.display_name, display_name);
        self.display_name = display_name.to_string();
        Ok(())
    }

    fn register(&mut self, id: MessageId, kind: RequestKind, action: &'static str) -> SessionResult<ReplyReceiver> {
        self.pending.register(id, kind)
            .map_err(|_| SessionError::RequestPending { action })
    }

    /// Matches a REPLY with the pending request it answers and applies its state transition. The
    ///  returned handle wakes the caller waiting for the reply. `ref_id` is `None` for transports
    ///  without correlation ids.
    pub fn accept_reply(&mut self, ref_id: Option<MessageId>, ok: bool) -> SessionResult<(RequestKind, ReplyHandle)> {
        let taken = match ref_id {
            Some(ref_id) => self.pending.take(ref_id),
            None => self.pending.take_single(),
        };
        let (kind, handle) = taken
            .ok_or_else(|| SessionError::Malformed(format!("REPLY for {:?} does not match a pending request", ref_id)))?;

        if kind == RequestKind::Auth && ok && self.fsm == FsmState::Authenticating {
            debug!("Authenticating -> Open");
            self.fsm = FsmState::Open;
        }
        Ok((kind, handle))
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Marks the session as shutting down. Returns the state before the shutdown if this call
    ///  started it, `None` if a shutdown is already under way or finished.
    pub fn begin_termination(&mut self, exit_code: i32) -> Option<FsmState> {
        if self.terminating || self.fsm == FsmState::End {
            return None;
        }
        self.terminating = true;
        self.exit_code.get_or_insert(exit_code);
        Some(self.fsm)
    }

    /// Moves to `End`, discarding all pending requests
    pub fn end(&mut self, exit_code: i32) {
        if self.fsm != FsmState::End {
            debug!("{:?} -> End", self.fsm);
        }
        self.terminating = true;
        self.exit_code.get_or_insert(exit_code);
        self.fsm = FsmState::End;
        self.pending.clear();
    }

    /// A shutdown that started out orderly ran into a fatal error, so it ends with a failure
    ///  code regardless of the code it started with
    pub fn mark_failed(&mut self) {
        self.exit_code = Some(1);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }
}

fn invalid_argument(e: anyhow::Error) -> SessionError {
    SessionError::InvalidArgument(e.to_string())
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    fn open_state() -> SessionState {
        let mut state = SessionState::new(10, true);
        state.fsm = FsmState::Open;
        state.display_name = "Bob".to_string();
        state
    }

    fn outcome(ok: bool) -> ReplyOutcome {
        ReplyOutcome { ok, content: "welcome".to_string() }
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let mut state = SessionState::new(10, true);
        assert_eq!(state.next_message_id().unwrap(), 0);
        assert_eq!(state.next_message_id().unwrap(), 1);
        assert_eq!(state.next_message_id().unwrap(), 2);
    }

    #[test]
    fn test_unnumbered_ids() {
        let mut state = SessionState::new(10, false);
        assert_eq!(state.next_message_id().unwrap(), 0);
        assert_eq!(state.next_message_id().unwrap(), 0);
    }

    #[test]
    fn test_id_exhaustion() {
        let mut state = SessionState::new(10, true);
        state.next_id = Some(u16::MAX);
        assert_eq!(state.next_message_id().unwrap(), u16::MAX);
        assert!(state.next_message_id().is_err());
        assert!(state.next_message_id().is_err());
    }

    #[rstest]
    #[case::allowed(FsmState::Open, &[FsmState::Open], true)]
    #[case::one_of(FsmState::Authenticating, &[FsmState::Start, FsmState::Authenticating], true)]
    #[case::not_allowed(FsmState::Start, &[FsmState::Open], false)]
    #[case::ended(FsmState::End, &[FsmState::Open], false)]
    fn test_require(#[case] fsm: FsmState, #[case] allowed: &[FsmState], #[case] expected: bool) {
        let mut state = SessionState::new(10, true);
        state.fsm = fsm;
        assert_eq!(state.require("x", allowed).is_ok(), expected);
    }

    #[tokio::test]
    async fn test_auth_success_opens_session() {
        let mut state = SessionState::new(10, true);
        let (msg, reply) = state.begin_auth("bob", "Bob", "pw").unwrap();
        assert_eq!(msg, Message::Auth { id: 0, username: "bob".to_string(), display_name: "Bob".to_string(), secret: "pw".to_string() });
        assert_eq!(state.fsm, FsmState::Authenticating);
        assert_eq!(state.display_name, "Bob");

        let (kind, handle) = state.accept_reply(Some(0), true).unwrap();
        assert_eq!(kind, RequestKind::Auth);
        assert_eq!(state.fsm, FsmState::Open);
        handle.resolve(outcome(true));
        assert!(reply.await.unwrap().ok);
    }

    #[tokio::test]
    async fn test_auth_failure_allows_retry() {
        let mut state = SessionState::new(10, true);
        let (_, reply) = state.begin_auth("bob", "Bob", "pw").unwrap();
        let (_, handle) = state.accept_reply(Some(0), false).unwrap();
        assert_eq!(state.fsm, FsmState::Authenticating);
        handle.resolve(outcome(false));
        assert!(!reply.await.unwrap().ok);

        let (msg, _reply) = state.begin_auth("bob", "Bobby", "pw2").unwrap();
        assert_eq!(msg.id(), Some(1));
        assert_eq!(state.display_name, "Bobby");
    }

    #[test]
    fn test_auth_rejected_when_open() {
        let mut state = open_state();
        assert!(matches!(state.begin_auth("bob", "Bob", "pw"), Err(SessionError::WrongState { action: ACTION_AUTH, state: FsmState::Open })));
        assert!(state.pending.is_empty());
        assert_eq!(state.next_message_id().unwrap(), 0);
    }

    #[test]
    fn test_invalid_arguments_consume_nothing() {
        let mut state = SessionState::new(10, true);
        assert!(matches!(state.begin_auth("bob smith", "Bob", "pw"), Err(SessionError::InvalidArgument(_))));
        assert_eq!(state.fsm, FsmState::Start);
        assert!(state.pending.is_empty());
        assert_eq!(state.next_message_id().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_join_failure_stays_open() {
        let mut state = open_state();
        let (msg, reply) = state.begin_join("general").unwrap();
        assert_eq!(msg, Message::Join { id: 0, channel_id: "general".to_string(), display_name: "Bob".to_string() });

        assert!(matches!(state.begin_join("other"), Err(SessionError::RequestPending { .. })));

        let (kind, handle) = state.accept_reply(Some(0), false).unwrap();
        assert_eq!(kind, RequestKind::Join);
        assert_eq!(state.fsm, FsmState::Open);
        handle.resolve(outcome(false));
        assert!(!reply.await.unwrap().ok);
    }

    #[test]
    fn test_unmatched_reply_is_malformed() {
        let mut state = open_state();
        assert!(matches!(state.accept_reply(Some(3), true), Err(SessionError::Malformed(_))));
        assert!(matches!(state.accept_reply(None, true), Err(SessionError::Malformed(_))));

        let (_, _reply) = state.begin_join("general").unwrap();
        assert!(matches!(state.accept_reply(Some(3), true), Err(SessionError::Malformed(_))));
        assert!(state.accept_reply(None, true).is_ok());
    }

    #[rstest]
    #[case::start(FsmState::Start, false)]
    #[case::authenticating(FsmState::Authenticating, false)]
    #[case::open(FsmState::Open, true)]
    fn test_chat_message_and_rename_require_open(#[case] fsm: FsmState, #[case] allowed: bool) {
        let mut state = open_state();
        state.fsm = fsm;
        assert_eq!(state.begin_chat_message("hello world").is_ok(), allowed);
        assert_eq!(state.rename("Robert").is_ok(), allowed);
    }

    #[test]
    fn test_rename_is_used_by_later_messages() {
        let mut state = open_state();
        state.rename("Robert").unwrap();
        let msg = state.begin_chat_message("hi").unwrap();
        assert_eq!(msg, Message::Msg { id: 0, display_name: "Robert".to_string(), content: "hi".to_string() });
        assert!(state.rename("not valid").is_err());
        assert_eq!(state.display_name, "Robert");
    }

    #[test]
    fn test_termination_is_started_once() {
        let mut state = open_state();
        assert_eq!(state.begin_termination(1), Some(FsmState::Open));
        assert_eq!(state.begin_termination(0), None);
        assert!(matches!(state.require(ACTION_MSG, &[FsmState::Open]), Err(SessionError::Closed)));

        state.end(0);
        assert_eq!(state.fsm, FsmState::End);
        assert_eq!(state.exit_code(), 1);
    }

    #[test]
    fn test_failed_goodbye_overrides_exit_code() {
        let mut state = open_state();
        assert_eq!(state.begin_termination(0), Some(FsmState::Open));
        state.mark_failed();
        state.end(0);
        assert_eq!(state.exit_code(), 1);
    }
}
