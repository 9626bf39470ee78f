use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::error::{SessionError, SessionResult};
use crate::message::MessageId;
use crate::session::output::ChatOutput;
use crate::session::pending::ReplyOutcome;
use crate::session::state::{FsmState, ReplyReceiver, SessionState};
use crate::transport::Transport;


/// What a session needs independently of its transport's framing: the state, the transport, the
///  user facing output, and the signal that stops the receive loop.
pub struct SessionCore<T: Transport> {
    pub transport: T,
    pub output: Arc<dyn ChatOutput>,
    pub config: Arc<ClientConfig>,
    pub state: Mutex<SessionState>,
    shutdown: watch::Sender<bool>,
}

impl <T: Transport> SessionCore<T> {
    pub fn new(transport: T, output: Arc<dyn ChatOutput>, config: Arc<ClientConfig>, numbered: bool) -> SessionCore<T> {
        let (shutdown, _) = watch::channel(false);
        SessionCore {
            state: Mutex::new(SessionState::new(config.recency_capacity, numbered)),
            transport,
            output,
            config,
            shutdown,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// completes once the session has ended
    pub async fn shut_down(&self) {
        let mut signal = self.shutdown.subscribe();
        loop {
            let is_shut_down = *signal.borrow_and_update();
            if is_shut_down || signal.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn fsm_state(&self) -> FsmState {
        self.state.lock().await.fsm
    }

    pub async fn is_terminating(&self) -> bool {
        self.state.lock().await.is_terminating()
    }

    pub async fn exit_code(&self) -> i32 {
        self.state.lock().await.exit_code()
    }

    pub async fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> SessionResult<R>) -> SessionResult<R> {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Starts an orderly shutdown, returning the state it started from and the display name to
    ///  say goodbye with. `None` if the session is already shutting down.
    pub async fn begin_termination(&self, exit_code: i32) -> Option<(FsmState, String)> {
        let mut state = self.state.lock().await;
        let previous = state.begin_termination(exit_code)?;
        debug!("terminating session in state {:?}", previous);
        Some((previous, state.display_name.clone()))
    }

    pub async fn mark_failed(&self) {
        self.state.lock().await.mark_failed();
    }

    /// Moves to `End`, releases the transport and stops the receive loop
    pub async fn finish(&self, exit_code: i32) {
        let exit_code = {
            let mut state = self.state.lock().await;
            state.end(exit_code);
            state.exit_code()
        };
        self.transport.close().await;
        self.shutdown.send_replace(true);
        info!("session ended, exit code {}", exit_code);
    }

    /// Shows a fatal error to the user, unless the session is already shutting down (in which
    ///  case the error is a consequence of that and was reported). Returns whether the error was
    ///  reported, i.e. whether the caller is responsible for ending the session.
    pub async fn report_fatal(&self, err: &SessionError) -> bool {
        if self.is_terminating().await {
            debug!("error during shutdown: {}", err);
            return false;
        }
        error!("{}", err);
        self.output.local_error(&err.user_text());
        true
    }

    /// Waits for the reply to a request that was delivered to the server
    pub async fn await_reply(&self, reply: ReplyReceiver) -> SessionResult<ReplyOutcome> {
        match timeout(self.config.reply_timeout, reply).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.state.lock().await.pending.clear();
                Err(SessionError::ReplyTimeout)
            }
        }
    }

    /// Hands a REPLY to the caller waiting for it, after showing it to the user
    pub async fn on_reply(&self, ref_id: Option<MessageId>, ok: bool, content: String) -> SessionResult<()> {
        let (kind, handle) = self.state.lock().await.accept_reply(ref_id, ok)?;
        debug!("{:?} request answered, ok: {}", kind, ok);
        self.output.reply(ok, &content);
        handle.resolve(ReplyOutcome { ok, content });
        Ok(())
    }
}
