//! Feeding data into a child's stdin.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio_stream::StreamExt;
use tracing::trace;

use crate::error::{Error, Result};
use crate::stdio::PipeSlot;

/// A source of bytes for a child's stdin.
pub enum Input {
    /// A single buffer.
    Bytes(Bytes),
    /// A finite, ordered list of buffers.
    Chunks(Vec<Bytes>),
    /// An asynchronous source, drained until it ends.
    Stream(BoxStream<'static, Bytes>),
}

impl Input {
    /// Input from a finite sequence of chunks.
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::Chunks(chunks.into_iter().map(Into::into).collect())
    }

    /// Input from an asynchronous source.
    pub fn stream<S>(source: S) -> Self
    where
        S: futures::Stream<Item = Bytes> + Send + 'static,
    {
        Self::Stream(Box::pin(source))
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Chunks(chunks) => f.debug_tuple("Chunks").field(&chunks.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for Input {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<&'static str> for Input {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Self::Bytes(s.into())
    }
}

/// Writer connected to a child's stdin.
#[derive(Debug)]
pub struct InputWriter {
    slot: Arc<PipeSlot<pipe::Sender>>,
}

impl InputWriter {
    pub(crate) const fn new(slot: Arc<PipeSlot<pipe::Sender>>) -> Self {
        Self { slot }
    }

    /// Write all of `bytes`, retrying partial writes.
    ///
    /// Returns the number of bytes written, which is always `bytes.len()`.
    /// Fails with [`Error::InvalidState`] once stdin has been closed.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let Some(mut guard) = self.slot.acquire().await else {
            return Err(Error::InvalidState("write to closed stdin"));
        };
        let Some(sender) = guard.as_mut() else {
            return Err(Error::InvalidState("write to closed stdin"));
        };

        let mut written = 0;
        while written < bytes.len() {
            let n = tokio::select! {
                biased;
                () = self.slot.closed().cancelled() => {
                    return Err(Error::InvalidState("stdin closed during write"));
                }
                n = sender.write(&bytes[written..]) => n.map_err(Error::WriteFailed)?,
            };
            if n == 0 {
                return Err(Error::WriteFailed(std::io::ErrorKind::WriteZero.into()));
            }
            written += n;
        }
        Ok(written)
    }

    /// Drain `input` into stdin. Returns the total number of bytes written.
    pub async fn feed(&mut self, input: Input) -> Result<usize> {
        let mut total = 0;
        match input {
            Input::Bytes(bytes) => total += self.write(&bytes).await?,
            Input::Chunks(chunks) => {
                for chunk in chunks {
                    total += self.write(&chunk).await?;
                }
            }
            Input::Stream(mut source) => {
                while let Some(chunk) = source.next().await {
                    total += self.write(&chunk).await?;
                }
            }
        }
        trace!(bytes = total, "fed stdin");
        Ok(total)
    }

    /// Drain `input`, then close stdin so the child sees end of file.
    pub async fn feed_and_close(mut self, input: Input) -> Result<usize> {
        let total = self.feed(input).await;
        self.close().await;
        total
    }

    /// Close stdin. Closing twice is a no-op.
    pub async fn close(&mut self) {
        self.slot.close().await;
    }

    /// Whether stdin has been closed.
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }
}
