//! Download stream wrapper that feeds the phase byte counter.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::progress::PhaseProgress;

/// Stream wrapper that counts bytes as they are pulled from the remote
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    progress: Arc<PhaseProgress>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, progress: Arc<PhaseProgress>) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            progress,
        }
    }

    /// Bytes pulled through this stream so far
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);

        if let Poll::Ready(Some(Ok(bytes))) = &polled {
            let chunk_size = bytes.len() as u64;
            self.bytes_transferred += chunk_size;
            self.progress.add_bytes(chunk_size);
        }

        polled
    }
}
