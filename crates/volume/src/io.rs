//! Streaming byte wrappers: transfer counting and checksum verification.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use cairn_core::locator::{BlockHash, BlockHasher};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A boxed stream of block bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wraps a byte stream, reporting the size of every chunk to a tally
/// callback. Feeds the per-bucket byte counters.
pub struct CountingStream {
    inner: ByteStream,
    tally: Arc<dyn Fn(u64) + Send + Sync>,
}

impl CountingStream {
    pub fn new(inner: ByteStream, tally: Arc<dyn Fn(u64) + Send + Sync>) -> Self {
        Self { inner, tally }
    }
}

impl Stream for CountingStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                (this.tally)(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Streams bytes while computing their MD5; fails the stream at the end if
/// the digest does not match the expected hash.
///
/// Consumers that read to the natural end of the stream (or call
/// [`HashCheckReader::finish`], which drains the remainder first) always get
/// the verification result. Partial reads without `finish` do not verify.
pub struct HashCheckReader {
    inner: ByteStream,
    expected: BlockHash,
    hasher: Option<BlockHasher>,
    /// Final digest outcome once the stream has been fully read;
    /// `Err` holds the actual hex digest.
    outcome: Option<std::result::Result<(), String>>,
    reported: bool,
}

impl HashCheckReader {
    pub fn new(inner: ByteStream, expected: BlockHash) -> Self {
        Self {
            inner,
            expected,
            hasher: Some(BlockHash::hasher()),
            outcome: None,
            reported: false,
        }
    }

    fn verify(&mut self) -> Result<()> {
        if let Some(hasher) = self.hasher.take() {
            let actual = hasher.finalize();
            self.outcome = Some(if actual == self.expected {
                Ok(())
            } else {
                Err(actual.to_hex())
            });
        }
        match &self.outcome {
            Some(Err(actual)) => Err(Error::Checksum {
                expected: self.expected.to_hex(),
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Drain and digest any unread remainder, then verify. Idempotent.
    pub async fn finish(&mut self) -> Result<()> {
        while let Some(item) = self.inner.next().await {
            let chunk = item?;
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&chunk);
            }
        }
        self.verify()
    }
}

impl Stream for HashCheckReader {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => match this.verify() {
                Ok(()) => Poll::Ready(None),
                Err(_) if this.reported => Poll::Ready(None),
                Err(err) => {
                    this.reported = true;
                    Poll::Ready(Some(Err(err)))
                }
            },
            other => other,
        }
    }
}

/// Drain a stream through a [`HashCheckReader`] into one buffer, with a
/// size cap. Used by the block API to verify reads end to end.
pub async fn collect_verified(
    stream: ByteStream,
    expected: BlockHash,
    max_size: u64,
) -> Result<Bytes> {
    let mut reader = HashCheckReader::new(stream, expected);
    let mut buf = BytesMut::new();
    while let Some(item) = reader.next().await {
        let chunk = item?;
        if buf.len() as u64 + chunk.len() as u64 > max_size {
            return Err(Error::Other(format!(
                "block exceeds maximum size of {max_size} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
