use std::future::Future;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::codec::datagram;
use crate::config::ClientConfig;
use crate::error::{SessionError, SessionResult, SERVER_ERROR_TEXT};
use crate::message::{Message, MessageId};
use crate::session::common::SessionCore;
use crate::session::output::ChatOutput;
use crate::session::pending::ReplyOutcome;
use crate::session::state::{FsmState, ReplyReceiver};
use crate::session::Session;
use crate::transport::udp::UdpTransport;
use crate::transport::Transport;


/// Why the receive loop ends the session
#[derive(Debug)]
enum Termination {
    ProtocolViolation(String),
    PeerError,
    PeerClosed,
    TransportFailed(String),
}

/// A chat session over the datagram transport.
///
/// Every message except CONFIRM is confirmed by its receiver. Outbound messages are
///  retransmitted until their CONFIRM arrives or the retransmission budget is exhausted, which
///  ends the session. Inbound messages are confirmed every time they arrive (the sender may have
///  missed an earlier CONFIRM), but handled only once.
///
/// The server answers from a dedicated port: the source of the first REPLY becomes the peer for
///  all further traffic, and datagrams from any other source are ignored from then on.
pub struct DatagramSession<T: Transport = UdpTransport> {
    core: SessionCore<T>,
    /// wakes senders waiting for a confirmation
    confirmations: Notify,
}

impl DatagramSession<UdpTransport> {
    pub async fn connect(server_addr: SocketAddr, output: Arc<dyn ChatOutput>, config: Arc<ClientConfig>) -> anyhow::Result<DatagramSession> {
        let transport = UdpTransport::new(server_addr).await?;
        Ok(DatagramSession::new(transport, output, config))
    }
}

impl <T: Transport> DatagramSession<T> {
    pub fn new(transport: T, output: Arc<dyn ChatOutput>, config: Arc<ClientConfig>) -> DatagramSession<T> {
        DatagramSession {
            core: SessionCore::new(transport, output, config, true),
            confirmations: Notify::new(),
        }
    }

    pub async fn fsm_state(&self) -> FsmState {
        self.core.fsm_state().await
    }

    /// Sends a message and waits for its CONFIRM, retransmitting after each confirmation timeout
    ///  up to the configured number of times
    async fn send_reliably(&self, msg: &Message) -> SessionResult<()> {
        let id = msg.id()
            .ok_or_else(|| anyhow!("{:?} can not be sent reliably", msg))?;
        let buf = datagram::encode(msg);

        let max_retransmissions = self.core.config.max_retransmissions;
        for attempt in 0..=max_retransmissions {
            if attempt > 0 {
                debug!("no confirmation for #{}, retransmission {} of {}", id, attempt, max_retransmissions);
            }
            else {
                debug!("sending {:?}", msg);
            }
            self.core.transport.send(&buf).await?;

            let deadline = Instant::now() + self.core.config.confirmation_timeout;
            select! {
                confirmed = self.await_confirmation(id, deadline) => {
                    if confirmed {
                        trace!("#{} confirmed", id);
                        return Ok(());
                    }
                }
                _ = self.core.shut_down() => {
                    return Err(SessionError::Closed);
                }
            }
        }
        Err(SessionError::NoResponse)
    }

    /// Returns `true` as soon as `id` is confirmed, `false` if the deadline passes first
    async fn await_confirmation(&self, id: MessageId, deadline: Instant) -> bool {
        loop {
            // register for wake-ups before checking, so a confirmation in between is not missed
            let mut notified = pin!(self.confirmations.notified());
            notified.as_mut().enable();

            if self.core.state.lock().await.confirmed.contains(&id) {
                return true;
            }

            select! {
                _ = notified => {}
                _ = sleep_until(deadline) => {
                    return self.core.state.lock().await.confirmed.contains(&id);
                }
            }
        }
    }

    async fn send_confirm(&self, ref_id: MessageId) {
        let buf = datagram::encode(&Message::Confirm { ref_id });
        if let Err(e) = self.core.transport.send(&buf).await {
            debug!("could not confirm #{}: {}", ref_id, e);
        }
    }

    async fn request(&self, msg: Message, reply: ReplyReceiver) -> SessionResult<ReplyOutcome> {
        self.send_reliably(&msg).await?;
        self.core.await_reply(reply).await
    }

    /// Ends the session after a fatal error in a local call. Protocol violations are announced to
    ///  the server, exhausted retransmissions end the session without any further traffic.
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

    /// Orderly shutdown: an optional ERR, then BYE (both confirmed) if a session was established,
    ///  then the transport is released
    async fn terminate(&self, exit_code: i32, error_notice: Option<&str>) {
        let Some((previous, display_name)) = self.core.begin_termination(exit_code).await else {
            return;
        };

        if previous != FsmState::Start {
            if let Err(e) = self.say_goodbye(display_name, error_notice).await {
                warn!("no orderly goodbye: {}", e);
                if matches!(e, SessionError::NoResponse) {
                    self.core.output.local_error(&e.user_text());
                }
                self.core.mark_failed().await;
            }
        }
        self.core.finish(exit_code).await;
    }

    async fn say_goodbye(&self, display_name: String, error_notice: Option<&str>) -> SessionResult<()> {
        if let Some(content) = error_notice {
            let id = self.core.state.lock().await.next_message_id()?;
            self.send_reliably(&Message::Err { id, display_name, content: content.to_string() }).await?;
        }
        let id = self.core.state.lock().await.next_message_id()?;
        self.send_reliably(&Message::Bye { id }).await
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

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) -> Option<Termination> {
        if from != self.core.transport.peer_addr() && self.core.state.lock().await.peer_bound {
            warn!("dropping datagram from unknown source {:?}", from);
            return None;
        }

        let msg = match datagram::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed datagram from {:?}: {}", from, e);
                let (fsm, terminating) = {
                    let state = self.core.state.lock().await;
                    (state.fsm, state.is_terminating())
                };
                if terminating {
                    return None;
                }
                if fsm != FsmState::Start {
                    if let Some(id) = datagram::peek_id(buf) {
                        self.send_confirm(id).await;
                    }
                }
                return Some(Termination::ProtocolViolation(e.to_string()));
            }
        };
        trace!("received {:?} from {:?}", msg, from);

        let Some(id) = msg.id() else {
            // only CONFIRM comes without an id of its own
            if let Message::Confirm { ref_id } = msg {
                self.on_confirmation(ref_id).await;
            }
            return None;
        };

        if let Message::Reply { .. } = msg {
            self.bind_peer(from).await;
        }
        self.send_confirm(id).await;

        {
            let mut state = self.core.state.lock().await;
            if state.is_terminating() {
                debug!("ignoring {:?} during shutdown", msg);
                return None;
            }
            if !state.received.add(id) {
                debug!("ignoring duplicate {:?}", msg);
                return None;
            }
        }

        self.dispatch(msg).await
    }

    async fn dispatch(&self, msg: Message) -> Option<Termination> {
        match msg {
            Message::Reply { ok, ref_id, content, .. } => {
                // a REPLY implies that its request arrived, even if the CONFIRM got lost
                self.on_confirmation(ref_id).await;
                match self.core.on_reply(Some(ref_id), ok, content).await {
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

    async fn on_confirmation(&self, ref_id: MessageId) {
        if !self.core.state.lock().await.confirmed.add(ref_id) {
            trace!("repeated confirmation for #{}", ref_id);
        }
        self.confirmations.notify_waiters();
    }

    /// switches to the server's dedicated port, once per session
    async fn bind_peer(&self, from: SocketAddr) {
        let mut state = self.core.state.lock().await;
        if state.peer_bound {
            return;
        }
        state.peer_bound = true;

        if from != self.core.transport.peer_addr() {
            info!("server continues the session from {:?}", from);
            if let Err(e) = self.core.transport.retarget(from) {
                warn!("could not switch to {:?}: {}", from, e);
            }
        }
    }
}

#[async_trait]
impl <T: Transport> Session for DatagramSession<T> {
    #[tracing::instrument(skip_all)]
    async fn run_receive_loop(&self) -> i32 {
        let mut shutdown = self.core.shutdown_signal();
        let mut buf = vec![0u8; self.core.config.max_datagram_size];

        // A shutdown triggered by the receive loop sends ERR and / or BYE, which need their
        //  CONFIRMs to be received: it runs alongside the loop rather than blocking it.
        let mut termination: Option<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = None;

        loop {
            let is_shut_down = *shutdown.borrow_and_update();
            if is_shut_down {
                break;
            }

            select! {
                received = self.core.transport.recv(&mut buf) => {
                    let cause = match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                        Err(e) => Some(Termination::TransportFailed(e.to_string())),
                    };
                    if let Some(cause) = cause {
                        if termination.is_none() {
                            termination = Some(Box::pin(self.on_termination(cause)));
                        }
                        else {
                            debug!("already terminating, ignoring {:?}", cause);
                        }
                    }
                }
                _ = async {
                    match termination.as_mut() {
                        Some(t) => t.await,
                        None => std::future::pending().await,
                    }
                } => {
                    termination = None;
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
            self.send_reliably(&msg).await
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
