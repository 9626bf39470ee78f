pub mod stream_reassembler;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;


/// The capabilities a session needs from the network. Implementations exist for UDP (where
///  the peer address can be switched after the server answers from a dedicated port) and for TCP.
///
/// This is an abstraction over socket I/O, introduced to facilitate replacing the network for
///  testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// sends the buffer to the current peer: as a single datagram for UDP, as raw bytes for TCP
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// receives the next datagram (or the next chunk of the byte stream), returning the number
    ///  of bytes read and their source. For TCP, `Ok((0, _))` signals EOF.
    ///
    /// Implementations must be cancel safe.
    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn peer_addr(&self) -> SocketAddr;

    /// switches all further traffic to a new peer address
    fn retarget(&self, peer: SocketAddr) -> anyhow::Result<()>;

    /// releases the underlying socket as far as possible; sending afterwards fails
    async fn close(&self);
}
