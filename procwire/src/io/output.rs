//! Lazy reader over a child's stdout or stderr.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::trace;

use super::Buffer;
use crate::error::{Error, Result};
use crate::stdio::PipeSlot;

/// Pull-based sequence of [`Buffer`]s read from one output pipe.
///
/// Each pull performs a single read of at most `chunk_size` bytes. End of
/// stream closes the descriptor and is reported once as `None`; every pull
/// after that also yields `None` without touching the descriptor.
///
/// Dropping or abandoning the stream does not close the descriptor by
/// itself: the owning [`crate::Execution`] closes it on teardown.
#[derive(Debug)]
pub struct OutputStream {
    slot: Arc<PipeSlot<pipe::Receiver>>,
    chunk_size: usize,
    finished: bool,
}

impl OutputStream {
    pub(crate) const fn new(slot: Arc<PipeSlot<pipe::Receiver>>, chunk_size: usize) -> Self {
        Self {
            slot,
            chunk_size,
            finished: false,
        }
    }

    /// Read the next chunk, or `None` at end of stream.
    ///
    /// A stream whose descriptor was closed by teardown also ends.
    pub async fn next_chunk(&mut self) -> Option<Result<Buffer>> {
        if self.finished {
            return None;
        }
        let Some(mut guard) = self.slot.acquire().await else {
            self.finished = true;
            return None;
        };
        let Some(receiver) = guard.as_mut() else {
            self.finished = true;
            return None;
        };

        let mut buf = vec![0_u8; self.chunk_size];
        let read = tokio::select! {
            biased;
            () = self.slot.closed().cancelled() => None,
            read = receiver.read(&mut buf) => Some(read),
        };

        match read {
            None => {
                self.slot.close_held(&mut guard);
                self.finished = true;
                None
            }
            Some(Ok(0)) => {
                trace!("output reached end of stream");
                self.slot.close_held(&mut guard);
                self.finished = true;
                None
            }
            Some(Ok(n)) => {
                buf.truncate(n);
                Some(Ok(Buffer::from(buf)))
            }
            Some(Err(e)) => Some(Err(Error::ReadFailed(e))),
        }
    }

    /// Whether end of stream has been observed.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Buffer>> + Send {
        stream::unfold(self, |mut output| async move {
            output.next_chunk().await.map(|chunk| (chunk, output))
        })
    }

    /// Drain the stream and concatenate every buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}
