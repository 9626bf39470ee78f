use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    /// binary messages over UDP, with the client's own confirmation and retransmission layer
    Udp,
    /// CRLF terminated text messages over TCP
    Tcp,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,

    /// host name or IP address literal
    pub server_host: String,
    pub server_port: u16,

    /// How long the datagram transport waits for a CONFIRM before retransmitting. This is per
    ///  attempt, so a message is given up on after `(max_retransmissions + 1) * confirmation_timeout`.
    pub confirmation_timeout: Duration,
    /// number of retransmissions after the initial send of a datagram message
    pub max_retransmissions: u8,

    /// Time allowed for the server's REPLY to an AUTH or JOIN, measured after the request was
    ///  delivered. Exceeding it is treated as a protocol error.
    pub reply_timeout: Duration,

    /// Number of message ids remembered for duplicate detection. A retransmission arriving after
    ///  this many newer messages is no longer recognized.
    pub recency_capacity: usize,

    pub max_datagram_size: usize,
}

impl ClientConfig {
    pub fn new(transport: TransportKind, server_host: impl Into<String>) -> ClientConfig {
        ClientConfig {
            transport,
            server_host: server_host.into(),
            server_port: 4567,
            confirmation_timeout: Duration::from_millis(250),
            max_retransmissions: 3,
            reply_timeout: Duration::from_secs(5),
            recency_capacity: 200,
            max_datagram_size: 65535,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_host.trim().is_empty() {
            bail!("server host must not be empty");
        }
        if self.server_port == 0 {
            bail!("server port must not be 0");
        }
        if self.confirmation_timeout.is_zero() {
            bail!("confirmation timeout must be positive");
        }
        if self.reply_timeout.is_zero() {
            bail!("reply timeout must be positive");
        }
        if self.recency_capacity == 0 {
            bail!("recency capacity must be positive");
        }
        if self.max_datagram_size < 3 {
            bail!("maximum datagram size {} can not hold a message header", self.max_datagram_size);
        }
        Ok(())
    }

    /// resolves the configured host, using the first address returned
    pub async fn resolve_server_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = tokio::net::lookup_host((self.server_host.as_str(), self.server_port)).await?
            .next()
            .ok_or_else(|| anyhow!("{} did not resolve to any address", self.server_host))?;
        debug!("resolved {} to {:?}", self.server_host, addr);
        Ok(addr)
    }
}
