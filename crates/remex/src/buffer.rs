//! Output accumulation and interval-driven delivery
//!
//! Remote output arrives in many small pieces. [`OutputBuffer`] collects them
//! and hands everything unread to a sink once per interval, so a consumer sees
//! a few large chunks instead of one callback per network read. With a zero
//! interval every chunk is passed straight through.
//!
//! In both modes the chunks delivered to the sink, concatenated in delivery
//! order, are exactly the chunks appended, concatenated in append order.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Receiver of drained output
pub trait OutputSink {
    /// Take ownership of a non-empty chunk of output
    fn deliver(&mut self, chunk: Bytes);
}

impl<F> OutputSink for F
where
    F: FnMut(Bytes),
{
    fn deliver(&mut self, chunk: Bytes) {
        self(chunk)
    }
}

/// Append-only output accumulator with a read cursor
#[derive(Debug)]
pub struct OutputBuffer {
    /// Bytes appended but not yet read
    unread: BytesMut,
    /// Total bytes handed out by `read`
    cursor: usize,
    interval: Duration,
    /// Created on the first `tick`, inside the runtime
    ticker: Option<Interval>,
}

impl OutputBuffer {
    /// Create a buffer draining every `interval`. A zero interval disables buffering.
    pub fn new(interval: Duration) -> Self {
        Self {
            unread: BytesMut::new(),
            cursor: 0,
            interval,
            ticker: None,
        }
    }

    /// Drain interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether chunks are accumulated between ticks
    pub fn is_buffered(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Offset of the first unread byte
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total bytes accumulated so far
    pub fn len(&self) -> usize {
        self.cursor + self.unread.len()
    }

    /// Whether there is nothing left to read
    pub fn is_empty(&self) -> bool {
        self.unread.is_empty()
    }

    /// Add a chunk of output.
    ///
    /// When buffering is disabled the chunk goes straight to `sink`;
    /// otherwise it waits for the next [`flush`](Self::flush).
    pub fn append<S>(&mut self, chunk: Bytes, sink: &mut S)
    where
        S: OutputSink + ?Sized,
    {
        if chunk.is_empty() {
            return;
        }
        if self.is_buffered() {
            self.unread.extend_from_slice(&chunk);
        } else {
            sink.deliver(chunk);
        }
    }

    /// Take everything appended since the previous read and advance the cursor past it
    pub fn read(&mut self) -> Bytes {
        let chunk = self.unread.split().freeze();
        self.cursor += chunk.len();
        chunk
    }

    /// Read and forward unread output to `sink`.
    ///
    /// Returns whether anything was delivered; the sink never sees an empty chunk.
    pub fn flush<S>(&mut self, sink: &mut S) -> bool
    where
        S: OutputSink + ?Sized,
    {
        let chunk = self.read();
        if chunk.is_empty() {
            return false;
        }
        sink.deliver(chunk);
        true
    }

    /// Wait for the next drain tick.
    ///
    /// The first tick fires one interval after the first call. Never completes
    /// when buffering is disabled.
    pub async fn tick(&mut self) {
        if !self.is_buffered() {
            return std::future::pending().await;
        }

        let period = self.interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }

    /// Cancel ticking and deliver whatever is still unread
    pub fn stop<S>(mut self, sink: &mut S)
    where
        S: OutputSink + ?Sized,
    {
        self.ticker = None;
        self.flush(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = OutputBuffer::new(Duration::from_millis(500));
        assert!(buffer.is_empty());
        assert!(buffer.is_buffered());
        assert_eq!(buffer.cursor(), 0);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_read_returns_only_new_bytes() {
        let mut buffer = OutputBuffer::new(Duration::from_secs(1));
        let mut ignore = |_chunk: Bytes| {};

        buffer.append(Bytes::from_static(b"hello "), &mut ignore);
        buffer.append(Bytes::from_static(b"world"), &mut ignore);
        assert!(!buffer.is_empty());

        assert_eq!(buffer.read(), Bytes::from_static(b"hello world"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.cursor(), 11);

        assert!(buffer.read().is_empty());

        buffer.append(Bytes::from_static(b"!\n"), &mut ignore);
        assert_eq!(buffer.read(), Bytes::from_static(b"!\n"));
        assert_eq!(buffer.cursor(), buffer.len());
    }

    #[test]
    fn test_flush_twice_delivers_once() {
        let mut buffer = OutputBuffer::new(Duration::from_secs(1));
        let mut delivered = Vec::new();
        let mut sink = |chunk: Bytes| delivered.push(chunk);

        buffer.append(Bytes::from_static(b"line\n"), &mut sink);
        assert!(buffer.flush(&mut sink));
        assert!(!buffer.flush(&mut sink));

        assert_eq!(delivered, vec![Bytes::from_static(b"line\n")]);
    }

    #[test]
    fn test_unbuffered_passes_chunks_through() {
        let mut buffer = OutputBuffer::new(Duration::ZERO);
        let mut delivered = Vec::new();
        let mut sink = |chunk: Bytes| delivered.push(chunk);

        buffer.append(Bytes::from_static(b"a"), &mut sink);
        assert!(buffer.is_empty());
        buffer.append(Bytes::from_static(b"bc"), &mut sink);
        buffer.append(Bytes::new(), &mut sink);

        assert!(!buffer.flush(&mut sink));
        assert_eq!(delivered, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
    }

    #[test]
    fn test_stop_flushes_trailing_output() {
        let mut buffer = OutputBuffer::new(Duration::from_secs(5));
        let mut delivered = Vec::new();
        let mut sink = |chunk: Bytes| delivered.push(chunk);

        buffer.append(Bytes::from_static(b"tail"), &mut sink);
        buffer.stop(&mut sink);

        assert_eq!(delivered, vec![Bytes::from_static(b"tail")]);
    }

    #[test]
    fn test_stop_on_empty_buffer_is_silent() {
        let buffer = OutputBuffer::new(Duration::from_secs(5));
        let mut calls = 0;
        buffer.stop(&mut |_chunk: Bytes| calls += 1);
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_waits_one_interval() {
        let mut buffer = OutputBuffer::new(Duration::from_secs(1));

        let early = tokio::time::timeout(Duration::from_millis(999), buffer.tick()).await;
        assert!(early.is_err());

        buffer.tick().await;
        let start = Instant::now();
        buffer.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbuffered_never_ticks() {
        let mut buffer = OutputBuffer::new(Duration::ZERO);
        let result = tokio::time::timeout(Duration::from_secs(3600), buffer.tick()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_coalesce_appends() {
        let mut buffer = OutputBuffer::new(Duration::from_millis(100));
        let mut delivered = Vec::new();
        let mut sink = |chunk: Bytes| delivered.push(chunk);

        for piece in ["one ", "two ", "three"] {
            buffer.append(Bytes::from(piece), &mut sink);
        }
        buffer.tick().await;
        buffer.flush(&mut sink);

        buffer.append(Bytes::from_static(b" four"), &mut sink);
        buffer.tick().await;
        buffer.flush(&mut sink);

        buffer.tick().await;
        buffer.flush(&mut sink);

        assert_eq!(delivered, vec![Bytes::from_static(b"one two three"), Bytes::from_static(b" four")]);
    }

    proptest! {
        #[test]
        fn test_unbuffered_delivers_exact_chunks(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 0..32)
        ) {
            let mut buffer = OutputBuffer::new(Duration::ZERO);
            let mut delivered = Vec::new();
            let mut sink = |chunk: Bytes| delivered.push(chunk.to_vec());

            for chunk in &chunks {
                buffer.append(Bytes::copy_from_slice(chunk), &mut sink);
            }

            prop_assert_eq!(delivered, chunks);
        }

        #[test]
        fn test_buffered_preserves_concatenation(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32),
            flush_after in prop::collection::vec(any::<bool>(), 32)
        ) {
            let mut buffer = OutputBuffer::new(Duration::from_millis(250));
            let mut delivered: Vec<Bytes> = Vec::new();
            let mut sink = |chunk: Bytes| delivered.push(chunk);

            for (chunk, flush) in chunks.iter().zip(flush_after.iter()) {
                buffer.append(Bytes::copy_from_slice(chunk), &mut sink);
                if *flush {
                    buffer.flush(&mut sink);
                }
                prop_assert!(buffer.cursor() <= buffer.len());
            }
            buffer.stop(&mut sink);

            prop_assert!(delivered.iter().all(|chunk| !chunk.is_empty()));
            let received: Vec<u8> = delivered.iter().flat_map(|chunk| chunk.iter().copied()).collect();
            let expected: Vec<u8> = chunks.concat();
            prop_assert_eq!(received, expected);
        }
    }
}
