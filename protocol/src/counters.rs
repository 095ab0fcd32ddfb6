//! §4.C Traffic Counters: wrap a splice endpoint so every byte moved
//! through it is reflected in the shared, atomic [`TrafficStats`].

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::SharedStats;

/// Which counter a [`CountingStream`] should credit as bytes flow through
/// its `AsyncRead` half. Writes always credit the complementary counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Reading from this stream is "up" traffic (local → public).
    Up,
    /// Reading from this stream is "down" traffic (public → local).
    Down,
}

pub struct CountingStream<S> {
    inner: S,
    stats: SharedStats,
    direction: Direction,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, stats: SharedStats, direction: Direction) -> Self {
        Self {
            inner,
            stats,
            direction,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            let counter = match this.direction {
                Direction::Up => &this.stats.bytes_up,
                Direction::Down => &this.stats.bytes_down,
            };
            counter.fetch_add(n, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            let counter = match this.direction {
                // The write half carries the opposite direction of the read half.
                Direction::Up => &this.stats.bytes_down,
                Direction::Down => &this.stats.bytes_up,
            };
            counter.fetch_add(*n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Records a round-trip time sample (milliseconds) from a PING echo.
pub fn record_rtt(stats: &SharedStats, rtt_ms: u64) {
    stats.latency_ms.store(rtt_ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_read() {
        let stats: SharedStats = Arc::new(crate::session::TrafficStats::default());
        let data = b"hello world".to_vec();
        let cursor = std::io::Cursor::new(data.clone());
        let mut counting = CountingStream::new(cursor, stats.clone(), Direction::Down);
        let mut out = Vec::new();
        counting.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(
            stats.bytes_down.load(Ordering::Relaxed),
            data.len() as u64
        );
    }

    #[tokio::test]
    async fn counts_bytes_written() {
        let stats: SharedStats = Arc::new(crate::session::TrafficStats::default());
        let sink = tokio::io::sink();
        let mut counting = CountingStream::new(sink, stats.clone(), Direction::Down);
        counting.write_all(b"abc").await.unwrap();
        assert_eq!(stats.bytes_up.load(Ordering::Relaxed), 3);
    }
}
