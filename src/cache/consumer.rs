use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::{RangeFault, ServeError};

use super::entry::{CacheEntry, FillPhase, FillProgress};

/// Tuning knobs for the chunk pacing heuristic. The defaults reproduce the
/// behavior this algorithm shipped with; both knobs are exposed through
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Target chunk size as a percentage of the requested range length.
    pub chunk_percent: u8,
    /// Pacing cycles that may fail the size threshold before the consumer
    /// serves whatever is available.
    pub attempt_cap: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            chunk_percent: 10,
            attempt_cap: 10,
        }
    }
}

/// An inclusive byte range validated against a known representation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Full representation. Callers must not use this for zero-length files.
    pub fn full(size: u64) -> Self {
        debug_assert!(size > 0);
        Self {
            start: 0,
            end: size - 1,
        }
    }

    /// Resolves a `bytes=<start>-<end>?` header value against `size`.
    ///
    /// The start must parse and lie in `[0, size)`. An absent end defaults
    /// to `size - 1`; a present end must parse, exceed the start, and stay
    /// below `size`.
    pub fn resolve(header: &str, size: u64) -> Result<Self, ServeError> {
        let spec = header
            .strip_prefix("bytes=")
            .ok_or(ServeError::InvalidRange(RangeFault::UnparsableStart))?;
        let (start_text, end_text) = spec
            .split_once('-')
            .ok_or(ServeError::InvalidRange(RangeFault::UnparsableStart))?;

        let start: u64 = start_text
            .trim()
            .parse()
            .map_err(|_| ServeError::InvalidRange(RangeFault::UnparsableStart))?;
        if start >= size {
            return Err(ServeError::InvalidRange(RangeFault::OutOfBounds));
        }

        let end = match end_text.trim() {
            "" => size - 1,
            text => {
                let end: u64 = text
                    .parse()
                    .map_err(|_| ServeError::InvalidRange(RangeFault::OutOfBounds))?;
                if end <= start || end >= size {
                    return Err(ServeError::InvalidRange(RangeFault::OutOfBounds));
                }
                end
            }
        };

        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Why a stream ended before delivering its full range.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The entry's producer hit a terminal fault.
    #[error(transparent)]
    Entry(#[from] ServeError),
    /// The sink (client connection) rejected further writes.
    #[error("sink write failed: {0}")]
    Sink(#[from] std::io::Error),
}

/// Per-request cursor that paces one byte range of a [`CacheEntry`] out to
/// a network sink.
///
/// Each pacing cycle serves the largest committed chunk it can, but only
/// once the chunk clears a size threshold that relaxes linearly with every
/// cycle that came up short; the final chunk of the range and a finished
/// producer are served immediately. Backpressure is the sink's own pending
/// write: while `write_all` is suspended the consumer is paused, and its
/// completion resumes the cycle. Dropping the consumer mid-stream drops its
/// progress subscription with it.
pub struct StreamConsumer {
    entry: Arc<CacheEntry>,
    progress: watch::Receiver<FillProgress>,
    range: ByteRange,
    read_offset: u64,
    ideal_chunk: u64,
    tick_attempt: u32,
    attempt_cap: u32,
    start_delay: Duration,
}

impl StreamConsumer {
    /// Binds a consumer to an entry known to be readable, with a range
    /// already validated against the entry's size.
    pub fn new(
        entry: Arc<CacheEntry>,
        range: ByteRange,
        config: PacingConfig,
        start_delay: Duration,
    ) -> Self {
        let ideal_chunk = (range.len() * u64::from(config.chunk_percent) / 100).max(1);
        let progress = entry.subscribe();
        Self {
            entry,
            progress,
            range,
            read_offset: range.start,
            ideal_chunk,
            tick_attempt: 0,
            attempt_cap: config.attempt_cap.max(1),
            start_delay,
        }
    }

    /// Streams the bound range to `sink`, returning the bytes delivered.
    ///
    /// Bytes arrive in ascending offset order with no gaps or duplicates;
    /// delivery resumes exactly where a stalled sink left off.
    pub async fn stream_to<W>(mut self, sink: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut delivered = 0u64;
        loop {
            if self.read_offset == self.range.end + 1 {
                return Ok(delivered);
            }

            self.tick_attempt += 1;
            let snapshot = self.progress.borrow_and_update().clone();
            if let FillPhase::Failed(err) = &snapshot.phase {
                return Err(err.clone().into());
            }

            if let Some((from, to)) = self.next_chunk(&snapshot) {
                self.tick_attempt = 0;
                let chunk = self.entry.copy_range(from, to);
                sink.write_all(&chunk).await?;
                delivered += chunk.len() as u64;
                self.read_offset = to + 1;
                continue;
            }

            if snapshot.writable() {
                if self.progress.changed().await.is_err() {
                    // Producer vanished without a terminal transition.
                    return Err(ServeError::Internal.into());
                }
            } else {
                // Drain path: no notification will ever fire again, so hand
                // the scheduler a turn and re-evaluate.
                tokio::task::yield_now().await;
            }
        }
    }

    /// One pacing decision over a progress snapshot: the chunk to serve
    /// now, or `None` to keep waiting.
    fn next_chunk(&self, progress: &FillProgress) -> Option<(u64, u64)> {
        // Never read past what the producer has committed.
        if progress.written <= self.read_offset {
            return None;
        }
        let output_max = self.range.end.min(progress.written - 1);
        let available = output_max - self.read_offset + 1;

        let final_chunk = output_max == self.range.end;
        let attempt = self.tick_attempt.min(self.attempt_cap);
        let threshold = self.ideal_chunk * u64::from(self.attempt_cap - attempt)
            / u64::from(self.attempt_cap);

        let serve = final_chunk
            || self.tick_attempt >= self.attempt_cap
            || available >= threshold
            || !progress.writable();
        serve.then_some((self.read_offset, output_max))
    }
}
