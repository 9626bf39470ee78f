use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::codec::datagram;
use crate::message::Message;
use crate::session::output::ChatOutput;
use crate::transport::Transport;


pub const TEST_SERVER: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 4567));
pub const TEST_SERVER_DYNAMIC: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 40123));

type Packet = (SocketAddr, Vec<u8>);

/// An in-memory [Transport] for running sessions against a scripted server: everything the
///  session sends shows up at the [ChannelPeer] together with its destination, and everything
///  the peer sends is received by the session with the peer-chosen source address.
pub struct ChannelTransport {
    peer: RwLock<SocketAddr>,
    outbound: mpsc::UnboundedSender<Packet>,
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: AtomicBool,
}

pub struct ChannelPeer {
    to_client: mpsc::UnboundedSender<Packet>,
    from_client: mpsc::UnboundedReceiver<Packet>,
}

pub fn channel_transport(server: SocketAddr) -> (ChannelTransport, ChannelPeer) {
    let (outbound, from_client) = mpsc::unbounded_channel();
    let (to_client, inbound) = mpsc::unbounded_channel();

    let transport = ChannelTransport {
        peer: RwLock::new(server),
        outbound,
        inbound: Mutex::new(inbound),
        closed: AtomicBool::new(false),
    };
    (transport, ChannelPeer { to_client, from_client })
}

impl ChannelTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("transport is closed");
        }
        self.outbound.send((self.peer_addr(), buf.to_vec()))
            .map_err(|_| anyhow!("test peer is gone"))
    }

    /// a closed channel is reported like EOF on a stream
    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        match self.inbound.lock().await.recv().await {
            Some((from, data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            None => Ok((0, self.peer_addr())),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        *self.peer.read().unwrap()
    }

    fn retarget(&self, peer: SocketAddr) -> anyhow::Result<()> {
        *self.peer.write().unwrap() = peer;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl ChannelPeer {
    pub fn send_from(&self, from: SocketAddr, data: &[u8]) {
        self.to_client.send((from, data.to_vec())).unwrap();
    }

    pub fn send_datagram(&self, from: SocketAddr, msg: &Message) {
        self.send_from(from, &datagram::encode(msg));
    }

    /// waits for the session's next send, returning destination and raw bytes
    pub async fn next_sent(&mut self) -> Packet {
        self.from_client.recv().await
            .expect("transport was dropped")
    }

    pub async fn next_datagram(&mut self) -> (SocketAddr, Message) {
        let (to, data) = self.next_sent().await;
        (to, datagram::decode(&data).unwrap())
    }

    pub async fn next_line(&mut self) -> String {
        let (_, data) = self.next_sent().await;
        String::from_utf8(data).unwrap()
    }

    pub fn try_next_sent(&mut self) -> Option<Packet> {
        self.from_client.try_recv().ok()
    }
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutputEvent {
    ChatMessage(String, String),
    Reply(bool, String),
    PeerError(String, String),
    LocalError(String),
}

/// Records everything a session shows to the user
#[derive(Default)]
pub struct TrackingChatOutput {
    tracker: std::sync::Mutex<Vec<OutputEvent>>,
}

impl TrackingChatOutput {
    /// returns recorded events, clearing the internal buffer
    pub fn events(&self) -> Vec<OutputEvent> {
        std::mem::take(&mut *self.tracker.lock().unwrap())
    }

    fn track(&self, evt: OutputEvent) {
        self.tracker.lock().unwrap().push(evt);
    }
}

impl ChatOutput for TrackingChatOutput {
    fn chat_message(&self, display_name: &str, content: &str) {
        self.track(OutputEvent::ChatMessage(display_name.to_string(), content.to_string()));
    }

    fn reply(&self, ok: bool, content: &str) {
        self.track(OutputEvent::Reply(ok, content.to_string()));
    }

    fn peer_error(&self, display_name: &str, content: &str) {
        self.track(OutputEvent::PeerError(display_name.to_string(), content.to_string()));
    }

    fn local_error(&self, text: &str) {
        self.track(OutputEvent::LocalError(text.to_string()));
    }
}
