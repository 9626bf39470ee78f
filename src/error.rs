use thiserror::Error;

use crate::session::state::FsmState;


/// What can go wrong with a call on a session. Usage errors leave the session untouched, all
///  other variants mean that the session is (being) terminated.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{action} is not allowed in state {state:?}")]
    WrongState {
        action: &'static str,
        state: FsmState,
    },
    #[error("{action} is not allowed while another request waits for its reply")]
    RequestPending {
        action: &'static str,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed or unexpected message: {0}")]
    Malformed(String),
    #[error("no confirmation from server after all retransmissions")]
    NoResponse,
    #[error("no reply from server in time")]
    ReplyTimeout,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self,
            SessionError::WrongState { .. } | SessionError::RequestPending { .. } | SessionError::InvalidArgument(_))
    }

    /// The text shown to the user after an "ERR: " prefix
    pub fn user_text(&self) -> String {
        match self {
            SessionError::WrongState { action, .. } => match *action {
                ACTION_AUTH => "You already authenticated.".to_string(),
                ACTION_JOIN => "You can't join a channel, if you're not authenticated.".to_string(),
                ACTION_MSG => "You can't send a message, if you're not authenticated.".to_string(),
                ACTION_RENAME => "You can't rename, if you're not authenticated.".to_string(),
                other => format!("{} is not possible right now.", other),
            }
            SessionError::RequestPending { .. } => "Wait for the server's reply to your previous request.".to_string(),
            SessionError::InvalidArgument(reason) => format!("Invalid input: {}.", reason),
            SessionError::Malformed(_) | SessionError::ReplyTimeout => SERVER_ERROR_TEXT.to_string(),
            SessionError::NoResponse => NO_RESPONSE_TEXT.to_string(),
            SessionError::Closed => "Session is closed.".to_string(),
            SessionError::Transport(e) => format!("Connection failed: {}", e),
        }
    }
}

pub const ACTION_AUTH: &str = "AUTH";
pub const ACTION_JOIN: &str = "JOIN";
pub const ACTION_MSG: &str = "MSG";
pub const ACTION_RENAME: &str = "RENAME";

pub const SERVER_ERROR_TEXT: &str = "Server error.";
pub const NO_RESPONSE_TEXT: &str = "No response from server.";

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_is_fatal() {
        assert!(!SessionError::WrongState { action: ACTION_JOIN, state: FsmState::Start }.is_fatal());
        assert!(!SessionError::RequestPending { action: ACTION_JOIN }.is_fatal());
        assert!(!SessionError::InvalidArgument("x".to_string()).is_fatal());
        assert!(SessionError::NoResponse.is_fatal());
        assert!(SessionError::Malformed("x".to_string()).is_fatal());
        assert!(SessionError::Transport(anyhow::anyhow!("boom")).is_fatal());
    }

    #[rstest]
    #[case::auth(ACTION_AUTH, "You already authenticated.")]
    #[case::join(ACTION_JOIN, "You can't join a channel, if you're not authenticated.")]
    #[case::msg(ACTION_MSG, "You can't send a message, if you're not authenticated.")]
    #[case::rename(ACTION_RENAME, "You can't rename, if you're not authenticated.")]
    fn test_wrong_state_text(#[case] action: &'static str, #[case] expected: &str) {
        let err = SessionError::WrongState { action, state: FsmState::Start };
        assert_eq!(err.user_text(), expected);
    }

    #[test]
    fn test_fatal_texts() {
        assert_eq!(SessionError::NoResponse.user_text(), "No response from server.");
        assert_eq!(SessionError::Malformed("x".to_string()).user_text(), "Server error.");
    }
}
