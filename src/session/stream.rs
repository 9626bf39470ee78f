use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::stream;
use crate::config::ClientConfig;
use crate::error::{SessionError, SessionResult, SERVER_ERROR_TEXT};
use crate::message::Message;
use crate::session::common::SessionCore;
use crate::session::output::ChatOutput;
use crate::session::pending::ReplyOutcome;
use crate::session::state::{FsmState, ReplyReceiver};
use crate::session::Session;
use crate::transport::stream_reassembler::{FrameTooLong, StreamReassembler};
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;


/// Why the receive loop ends the session
#[derive(Debug)]
enum Termination {
    ProtocolViolation(String),
    PeerError,
    PeerClosed,
    TransportFailed(String),
}

/// A chat session over the stream transport. Delivery and ordering are the transport's business,
///  so there are no confirmations and no message ids: a REPLY answers the single pending request.
pub struct StreamSession<T: Transport = TcpTransport> {
    core: SessionCore<T>,
    /// owned by the receive loop while it runs
    reassembler: Mutex<StreamReassembler>,
}

impl StreamSession<TcpTransport> {
    /// establishes the connection right away, so that connection problems surface before any
    ///  user interaction
    pub async fn connect(server_addr: SocketAddr, output: Arc<dyn ChatOutput>, config: Arc<ClientConfig>) -> anyhow::Result<StreamSession> {
        let transport = TcpTransport::connect(server_addr).await?;
        Ok(StreamSession::new(transport, output, config))
    }
}

impl <T: Transport> StreamSession<T> {
    pub fn new(transport: T, output: Arc<dyn ChatOutput>, config: Arc<ClientConfig>) -> StreamSession<T> {
        StreamSession {
            core: SessionCore::new(transport, output, config, false),
            reassembler: Mutex::new(StreamReassembler::new()),
        }
    }

    pub async fn fsm_state(&self) -> FsmState {
        self.core.fsm_state().await
    }

    async fn send(&self, msg: &Message) -> SessionResult<()> {
        let line = stream::encode(msg)?;
        debug!("sending {:?}", msg);
        self.core.transport.send(line.as_bytes()).await?;
        Ok(())
    }

    async fn request(&self, msg: Message, reply: ReplyReceiver) -> SessionResult<ReplyOutcome> {
        self.send(&msg).await?;
        self.core.await_reply(reply).await
    }

    async fn fail(&self, err: SessionError) -> SessionError {
        if !err.is_fatal() || !self.core.report_fatal(&err).await {
            return err;
        }
        match err {
            SessionError::Malformed(_) | SessionError::ReplyTimeout => {
                self.terminate(1, Some(SERVER_ERROR_TEXT)).await;
            }
            _ => self.core.finish(1).await,
        }
        err
    }

    async fn checked<R>(&self, result: SessionResult<R>) -> SessionResult<R> {
        match result {
            Ok(r) => Ok(r),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Orderly shutdown: an optional ERR, then BYE if a session was established, then the
    ///  connection is closed
    async fn terminate(&self, exit_code: i32, error_notice: Option<&str>) {
        let Some((previous, display_name)) = self.core.begin_termination(exit_code).await else {
            return;
        };

        if previous != FsmState::Start {
            if let Err(e) = self.say_goodbye(display_name, error_notice).await {
                warn!("no orderly goodbye: {}", e);
                self.core.mark_failed().await;
            }
        }
        self.core.finish(exit_code).await;
    }

    async fn say_goodbye(&self, display_name: String, error_notice: Option<&str>) -> SessionResult<()> {
        if let Some(content) = error_notice {
            self.send(&Message::Err { id: 0, display_name, content: content.to_string() }).await?;
        }
        self.send(&Message::Bye { id: 0 }).await
    }

    async fn on_termination(&self, cause: Termination) {
        debug!("terminating: {:?}", cause);
        match cause {
            Termination::ProtocolViolation(reason) => {
                let err = SessionError::Malformed(reason);
                if self.core.report_fatal(&err).await {
                    self.terminate(1, Some(SERVER_ERROR_TEXT)).await;
                }
            }
            Termination::PeerError => self.terminate(1, None).await,
            Termination::PeerClosed => self.core.finish(0).await,
            Termination::TransportFailed(reason) => {
                let err = SessionError::Transport(anyhow!(reason));
                if self.core.report_fatal(&err).await {
                    self.core.finish(1).await;
                }
            }
        }
    }

    async fn on_frame(&self, frame: &[u8]) -> Option<Termination> {
        let decoded = std::str::from_utf8(frame)
            .map_err(anyhow::Error::from)
            .and_then(stream::decode);
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed line {:?}: {}", String::from_utf8_lossy(frame), e);
                if self.core.is_terminating().await {
                    return None;
                }
                return Some(Termination::ProtocolViolation(e.to_string()));
            }
        };
        trace!("received {:?}", msg);

        if self.core.is_terminating().await {
            debug!("ignoring {:?} during shutdown", msg);
            return None;
        }

        match msg {
            Message::Reply { ok, content, .. } => {
                match self.core.on_reply(None, ok, content).await {
                    Ok(()) => None,
                    Err(e) => Some(Termination::ProtocolViolation(e.to_string())),
                }
            }
            Message::Msg { display_name, content, .. } => {
                self.core.output.chat_message(&display_name, &content);
                None
            }
            Message::Err { display_name, content, .. } => {
                self.core.output.peer_error(&display_name, &content);
                Some(Termination::PeerError)
            }
            Message::Bye { .. } => {
                info!("server ended the session");
                Some(Termination::PeerClosed)
            }
            other => Some(Termination::ProtocolViolation(format!("unexpected {:?} from server", other))),
        }
    }
}

#[async_trait]
impl <T: Transport> Session for StreamSession<T> {
    #[tracing::instrument(skip_all)]
    async fn run_receive_loop(&self) -> i32 {
        let mut shutdown = self.core.shutdown_signal();
        let mut reassembler = self.reassembler.lock().await;

        loop {
            let is_shut_down = *shutdown.borrow_and_update();
            if is_shut_down {
                break;
            }

            select! {
                frame = reassembler.next_frame(&self.core.transport) => {
                    let cause = match frame {
                        Ok(frame) => self.on_frame(&frame).await,
                        Err(e) if e.is::<FrameTooLong>() => Some(Termination::ProtocolViolation(e.to_string())),
                        Err(e) => Some(Termination::TransportFailed(e.to_string())),
                    };
                    // no confirmations to wait for, so shutting down can block the loop
                    if let Some(cause) = cause {
                        self.on_termination(cause).await;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        let exit_code = self.core.exit_code().await;
        debug!("receive loop finished, exit code {}", exit_code);
        exit_code
    }

    async fn authenticate(&self, username: &str, display_name: &str, secret: &str) -> SessionResult<ReplyOutcome> {
        let result = async {
            let (msg, reply) = self.core.with_state(|s| s.begin_auth(username, display_name, secret)).await?;
            self.request(msg, reply).await
        }.await;
        self.checked(result).await
    }

    async fn join_channel(&self, channel_id: &str) -> SessionResult<ReplyOutcome> {
        let result = async {
            let (msg, reply) = self.core.with_state(|s| s.begin_join(channel_id)).await?;
            self.request(msg, reply).await
        }.await;
        self.checked(result).await
    }

    async fn send_chat_message(&self, content: &str) -> SessionResult<()> {
        let result = async {
            let msg = self.core.with_state(|s| s.begin_chat_message(content)).await?;
            self.send(&msg).await
        }.await;
        self.checked(result).await
    }

    async fn rename(&self, display_name: &str) -> SessionResult<()> {
        self.core.with_state(|s| s.rename(display_name)).await
    }

    async fn end_session(&self) -> SessionResult<()> {
        self.terminate(0, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tokio::task::JoinHandle;
    use super::*;
    use crate::config::TransportKind;
    use crate::test_util::{channel_transport, ChannelPeer, ChannelTransport, OutputEvent, TrackingChatOutput, TEST_SERVER};
    use crate::transport::MockTransport;

    struct Fixture {
        session: Arc<StreamSession<ChannelTransport>>,
        peer: ChannelPeer,
        output: Arc<TrackingChatOutput>,
        receive_loop: JoinHandle<i32>,
    }

    fn config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new(TransportKind::Tcp, "localhost"))
    }

    fn start() -> Fixture {
        let (transport, peer) = channel_transport(TEST_SERVER);
        let output = Arc::new(TrackingChatOutput::default());
        let session = Arc::new(StreamSession::new(transport, output.clone(), config()));

        let receive_loop = tokio::spawn({
            let session = session.clone();
            async move { session.run_receive_loop().await }
        });
        Fixture { session, peer, output, receive_loop }
    }

    async fn start_open() -> Fixture {
        let f = start();
        let mut state = f.session.core.state.lock().await;
        state.fsm = FsmState::Open;
        state.display_name = "Bob".to_string();
        drop(state);
        f
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_and_chat() {
        let mut f = start();
        let auth = tokio::spawn({
            let session = f.session.clone();
            async move { session.authenticate("bob", "Bob", "pw").await }
        });

        assert_eq!(f.peer.next_line().await, "AUTH bob AS Bob USING pw\r\n");
        // the reply arrives split across reads
        f.peer.send_from(TEST_SERVER, b"REPLY OK IS wel");
        f.peer.send_from(TEST_SERVER, b"come\r\nMSG FROM Server IS Bob joined\r\n");

        assert_eq!(auth.await.unwrap().unwrap(), ReplyOutcome { ok: true, content: "welcome".to_string() });
        assert_eq!(f.session.fsm_state().await, FsmState::Open);

        f.session.send_chat_message("hello everyone").await.unwrap();
        assert_eq!(f.peer.next_line().await, "MSG FROM Bob IS hello everyone\r\n");

        assert_eq!(f.output.events(), vec![
            OutputEvent::Reply(true, "welcome".to_string()),
            OutputEvent::ChatMessage("Server".to_string(), "Bob joined".to_string()),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_failure_keeps_session_open() {
        let mut f = start_open().await;
        let join = tokio::spawn({
            let session = f.session.clone();
            async move { session.join_channel("secret-room").await }
        });

        assert_eq!(f.peer.next_line().await, "JOIN secret-room AS Bob\r\n");
        f.peer.send_from(TEST_SERVER, b"reply nok is no access\r\n");

        assert!(!join.await.unwrap().unwrap().ok);
        assert_eq!(f.session.fsm_state().await, FsmState::Open);
        assert_eq!(f.output.events(), vec![OutputEvent::Reply(false, "no access".to_string())]);
    }

    #[tokio::test]
    async fn test_authenticate_while_open_sends_nothing() {
        let session = StreamSession::new(MockTransport::new(), Arc::new(TrackingChatOutput::default()), config());
        session.core.state.lock().await.fsm = FsmState::Open;

        assert!(matches!(session.authenticate("bob", "Bob", "pw").await, Err(SessionError::WrongState { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_err_from_server_says_bye() {
        let mut f = start_open().await;
        f.peer.send_from(TEST_SERVER, b"ERR FROM Server IS shutting down\r\n");

        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert_eq!(f.receive_loop.await.unwrap(), 1);
        assert_eq!(f.output.events(), vec![OutputEvent::PeerError("Server".to_string(), "shutting down".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_is_answered_with_err() {
        let mut f = start_open().await;
        f.peer.send_from(TEST_SERVER, b"MSG FROM Bob\r\n");

        assert_eq!(f.peer.next_line().await, "ERR FROM Bob IS Server error.\r\n");
        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert_eq!(f.receive_loop.await.unwrap(), 1);
        assert_eq!(f.output.events(), vec![OutputEvent::LocalError("Server error.".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_without_request_is_a_protocol_violation() {
        let mut f = start_open().await;
        f.peer.send_from(TEST_SERVER, b"REPLY OK IS surprise\r\n");

        assert_eq!(f.peer.next_line().await, "ERR FROM Bob IS Server error.\r\n");
        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert_eq!(f.receive_loop.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bye_from_server() {
        let mut f = start_open().await;
        f.peer.send_from(TEST_SERVER, b"BYE\r\n");

        assert_eq!(f.receive_loop.await.unwrap(), 0);
        assert!(f.peer.try_next_sent().is_none());
        assert_eq!(f.session.fsm_state().await, FsmState::End);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session() {
        let mut f = start_open().await;

        f.session.end_session().await.unwrap();
        f.session.end_session().await.unwrap();

        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert!(f.peer.try_next_sent().is_none());
        assert_eq!(f.receive_loop.await.unwrap(), 0);
        assert!(f.session.core.transport.is_closed());
    }

    #[tokio::test]
    async fn test_failed_bye_ends_with_failure() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .times(1)
            .returning(|_| Err(anyhow!("connection reset")));
        transport.expect_close()
            .times(1)
            .returning(|| ());
        let session = StreamSession::new(transport, Arc::new(TrackingChatOutput::default()), config());
        session.core.state.lock().await.fsm = FsmState::Open;

        session.end_session().await.unwrap();
        assert_eq!(session.fsm_state().await, FsmState::End);
        assert_eq!(session.core.exit_code().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_line_is_answered_with_err() {
        let mut f = start_open().await;
        f.peer.send_from(TEST_SERVER, &vec![b'x'; 3000]);

        assert_eq!(f.peer.next_line().await, "ERR FROM Bob IS Server error.\r\n");
        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert_eq!(f.receive_loop.await.unwrap(), 1);
        assert_eq!(f.output.events(), vec![OutputEvent::LocalError("Server error.".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_is_a_protocol_violation() {
        let mut f = start_open().await;
        let result = f.session.join_channel("general").await;
        assert!(matches!(result, Err(SessionError::ReplyTimeout)));

        assert_eq!(f.peer.next_line().await, "JOIN general AS Bob\r\n");
        assert_eq!(f.peer.next_line().await, "ERR FROM Bob IS Server error.\r\n");
        assert_eq!(f.peer.next_line().await, "BYE\r\n");
        assert_eq!(f.receive_loop.await.unwrap(), 1);
    }
}
