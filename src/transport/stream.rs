//! [`Channel`] over any tokio byte stream.
//!
//! TCP streams, UNIX streams and named pipe handles all implement
//! `AsyncRead + AsyncWrite`, so one implementation covers every backend.

use std::io;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::tcp::SelectionKey;
use super::{Channel, ReadStatus};

/// Channel owning one stream. The stream is dropped exactly once, on the
/// first [`Channel::close`] (or when the channel itself is dropped).
pub struct StreamChannel<S> {
    name: String,
    stream: Option<S>,
    key: Option<SelectionKey>,
}

impl<S> StreamChannel<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
            key: None,
        }
    }

    /// Attach the accept loop's registration for this peer.
    #[must_use]
    pub(crate) fn with_key(mut self, key: SelectionKey) -> Self {
        self.key = Some(key);
        self
    }

    fn stream_mut(&mut self) -> io::Result<&mut S> {
        self.stream.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("channel {} is closed", self.name),
            )
        })
    }
}

impl<S> std::fmt::Debug for StreamChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("name", &self.name)
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let stream = self.stream_mut()?;
        let n = stream.read(buf).await?;
        Ok(classify(n, buf.len()))
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let stream = self.stream_mut()?;
        match stream.read(buf).now_or_never() {
            None => Ok(ReadStatus::Empty),
            Some(result) => Ok(classify(result?, buf.len())),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream_mut()?;
        let n = stream.write(buf).await?;
        stream.flush().await?;
        Ok(n)
    }

    async fn close(&mut self) {
        // The key goes first so the accept loop never tracks a freed handle.
        if let Some(key) = self.key.take() {
            key.cancel();
        }
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(channel = %self.name, error = %e, "Shutdown on close failed");
            }
            drop(stream);
            debug!(channel = %self.name, "Channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

const fn classify(n: usize, requested: usize) -> ReadStatus {
    if n == 0 && requested > 0 {
        ReadStatus::Eof
    } else {
        ReadStatus::Data(n)
    }
}
