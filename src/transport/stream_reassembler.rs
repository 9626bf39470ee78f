use std::collections::VecDeque;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::transport::Transport;

/// Longest line the text protocol can legitimately produce is a MSG/ERR with maximum display name
///  and content (~1.4k), so anything beyond this without a terminator is garbage
pub const MAX_FRAME_LEN: usize = 2048;

const READ_BUF_SIZE: usize = 4096;

/// The peer sent more than [MAX_FRAME_LEN] bytes without a line terminator. This is malformed
///  data rather than a connection problem.
#[derive(Debug, Error)]
#[error("{0} bytes received without a line terminator")]
pub struct FrameTooLong(pub usize);


/// Turns the raw byte stream of a TCP connection into CRLF delimited frames.
///
/// Bytes after the last terminator of a read are kept verbatim and prefixed to the next read, so
///  frames may be split at arbitrary points (including inside the terminator) without losing or
///  duplicating data. Frames are returned without their terminator, and empty lines are skipped.
pub struct StreamReassembler {
    lines: LineBuffer,
    read_buf: Vec<u8>,
}

#[derive(Default)]
struct LineBuffer {
    partial: BytesMut,
    /// offset into `partial` before which there is no terminator
    scanned: usize,
    frames: VecDeque<Bytes>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.partial.extend_from_slice(data);

        while let Some(pos) = self.partial[self.scanned..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| p + self.scanned)
        {
            let mut frame = self.partial.split_to(pos + 2);
            frame.truncate(pos);
            self.scanned = 0;

            if frame.is_empty() {
                debug!("skipping empty line");
                continue;
            }
            trace!("complete frame: {:?}", frame.as_ref());
            self.frames.push_back(frame.freeze());
        }

        // a trailing '\r' may still be the first half of a terminator
        self.scanned = self.partial.len().saturating_sub(1);

        if self.partial.len() > MAX_FRAME_LEN {
            return Err(FrameTooLong(self.partial.len()).into());
        }
        Ok(())
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        StreamReassembler::new()
    }
}

impl StreamReassembler {
    pub fn new() -> StreamReassembler {
        StreamReassembler {
            lines: LineBuffer::default(),
            read_buf: vec![0u8; READ_BUF_SIZE],
        }
    }

    /// Appends raw bytes, queueing every frame they complete
    pub fn push(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.lines.push(data)
    }

    /// Returns the next queued frame without reading from the network
    pub fn pop_frame(&mut self) -> Option<Bytes> {
        self.lines.frames.pop_front()
    }

    /// bytes of an incomplete frame held back for the next read
    pub fn pending_len(&self) -> usize {
        self.lines.partial.len()
    }

    /// Returns the next complete frame, reading from the transport as long as none is queued.
    ///
    /// This is cancel safe: bytes are only consumed from the transport by a completed read.
    pub async fn next_frame<T: Transport + ?Sized>(&mut self, transport: &T) -> anyhow::Result<Bytes> {
        loop {
            if let Some(frame) = self.lines.frames.pop_front() {
                return Ok(frame);
            }

            let (num_read, _) = transport.recv(&mut self.read_buf).await?;
            if num_read == 0 {
                bail!("connection closed by peer");
            }
            self.lines.push(&self.read_buf[..num_read])?;
        }
    }
}
