use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::transport::Transport;


pub struct UdpTransport {
    /// `None` after close. A receive that is in flight keeps its own reference, so the port is
    ///  released once that receive is cancelled or completes.
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peer: RwLock<SocketAddr>,
}

impl UdpTransport {
    /// binds an ephemeral local port of the server address' family
    pub async fn new(server_addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let local = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(SocketAddr::from_str(local)?).await?;
        info!("bound UDP socket to {:?}, server is {:?}", socket.local_addr()?, server_addr);

        Ok(UdpTransport {
            socket: RwLock::new(Some(Arc::new(socket))),
            peer: RwLock::new(server_addr),
        })
    }

    fn socket(&self) -> anyhow::Result<Arc<UdpSocket>> {
        self.socket.read().unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("UDP transport is closed"))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        let socket = self.socket()?;
        let to = self.peer_addr();
        trace!("sending datagram to {:?}: {:?}", to, buf);
        socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let socket = self.socket()?;
        let (len, from) = socket.recv_from(buf).await?;
        trace!("received datagram from {:?}: {:?}", from, &buf[..len]);
        Ok((len, from))
    }

    fn peer_addr(&self) -> SocketAddr {
        *self.peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn retarget(&self, peer: SocketAddr) -> anyhow::Result<()> {
        let mut lock = self.peer.write().unwrap_or_else(PoisonError::into_inner);
        debug!("switching peer from {:?} to {:?}", *lock, peer);
        *lock = peer;
        Ok(())
    }

    async fn close(&self) {
        if self.socket.write().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            debug!("closed UDP socket");
        }
    }
}
