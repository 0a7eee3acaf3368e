//! Transport layer shared by agent and clients.
//!
//! Provides the [`Channel`] trait every backend implements and the
//! length-prefixed framing functions the protocol layer is written against.
//! Backends: TCP sockets, UNIX domain sockets, Windows named pipes.

pub mod client;
pub mod pipe;
pub mod server;
pub mod stream;
pub mod tcp;
pub mod unix;

pub use client::ClientTransport;
pub use server::{listen, ListenAddress, ServerHandle};
pub use stream::StreamChannel;

use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::IpcError;

/// Maximum frame size (16 MB). Safety valve against malformed messages.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Pause before accepting again after a failed `accept`.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of a read on a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// No data available right now. Only returned by [`Channel::try_read`].
    Empty,
    /// The peer closed its end.
    Eof,
}

/// A bidirectional byte stream to exactly one peer.
///
/// Every backend exposes the same surface, so the protocol layer never knows
/// which transport it is talking over.
#[async_trait]
pub trait Channel: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Wait for data. Never returns [`ReadStatus::Empty`] for a non-empty buffer.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Read whatever is available without waiting.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Write some prefix of `buf`, returning how many bytes went out.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release the native handle. Calling this more than once is a no-op.
    async fn close(&mut self);

    /// Local state only: `false` once [`Channel::close`] ran.
    fn is_open(&self) -> bool;
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        (**self).read(buf).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        (**self).try_read(buf)
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf).await
    }

    async fn close(&mut self) {
        (**self).close().await;
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Write a length-prefixed message to a channel.
///
/// Format: [4-byte big-endian length][payload bytes]. Partial writes are
/// retried until the whole frame is out.
pub async fn send_message<C: Channel + ?Sized>(channel: &mut C, payload: &[u8]) -> Result<(), IpcError> {
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(payload.len()))?;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(payload.len()));
    }

    write_all(channel, &len.to_be_bytes()).await?;
    write_all(channel, payload).await?;
    Ok(())
}

/// Read a length-prefixed message from a channel.
///
/// Returns `None` if the peer closed the channel cleanly between frames.
/// EOF inside a frame is an [`io::ErrorKind::UnexpectedEof`] error.
pub async fn recv_message<C: Channel + ?Sized>(channel: &mut C) -> Result<Option<Vec<u8>>, IpcError> {
    let mut len_buf = [0u8; 4];
    if !read_exact(channel, &mut len_buf, true).await? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len as usize));
    }

    let mut buf = vec![0u8; len as usize];
    read_exact(channel, &mut buf, false).await?;
    Ok(Some(buf))
}

async fn write_all<C: Channel + ?Sized>(channel: &mut C, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match channel.write(buf).await? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("{}: peer stopped accepting data", channel.name()),
                ));
            }
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Fill `buf`. Returns `false` only when `eof_ok` and the peer closed before
/// the first byte arrived.
async fn read_exact<C: Channel + ?Sized>(channel: &mut C, buf: &mut [u8], eof_ok: bool) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match channel.read(&mut buf[filled..]).await? {
            ReadStatus::Data(n) => filled += n,
            ReadStatus::Empty => tokio::task::yield_now().await,
            ReadStatus::Eof if filled == 0 && eof_ok => return Ok(false),
            ReadStatus::Eof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: peer closed mid-frame", channel.name()),
                ));
            }
        }
    }
    Ok(true)
}
