use std::net::SocketAddr;

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::transport::Transport;


/// A TCP connection to the server, split so that the receive loop and the sending side never
///  contend for the same lock
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub async fn connect(server_addr: SocketAddr) -> anyhow::Result<TcpTransport> {
        let stream = TcpStream::connect(server_addr).await?;
        info!("connected to {:?} from {:?}", server_addr, stream.local_addr()?);
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> anyhow::Result<TcpTransport> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            peer,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        let mut lock = self.writer.lock().await;
        match lock.as_mut() {
            Some(writer) => {
                trace!("sending {:?}", buf);
                writer.write_all(buf).await?;
                Ok(())
            }
            None => bail!("sending on a closed TCP connection"),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let num_read = self.reader.lock().await
            .read(buf).await?;
        Ok((num_read, self.peer))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn retarget(&self, peer: SocketAddr) -> anyhow::Result<()> {
        bail!("a TCP connection can not be moved to {:?}", peer)
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down TCP connection: {}", e);
            }
        }
    }
}
