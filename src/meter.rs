/// 流量计量连接
///
/// 包装任意连接，统计读/写字节数，其余行为完全透传
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 全局流量计数器
#[derive(Debug, Default)]
pub struct TrafficCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计读取字节数
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// 累计写入字节数
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// 计量连接
pub struct MeteredStream<S> {
    inner: S,
    counters: Arc<TrafficCounters>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, counters: Arc<TrafficCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            self.counters.read.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = result {
            self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counts_both_directions() {
        let counters = Arc::new(TrafficCounters::new());
        let (a, mut b) = tokio::io::duplex(64);
        let mut metered = MeteredStream::new(a, counters.clone());

        metered.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        metered.read_exact(&mut buf).await.unwrap();

        assert_eq!(counters.bytes_written(), 5);
        assert_eq!(counters.bytes_read(), 6);
    }

    #[tokio::test]
    async fn test_counters_shared_between_streams() {
        let counters = Arc::new(TrafficCounters::new());
        let (a1, _b1) = tokio::io::duplex(64);
        let (a2, _b2) = tokio::io::duplex(64);
        let mut m1 = MeteredStream::new(a1, counters.clone());
        let mut m2 = MeteredStream::new(a2, counters.clone());

        m1.write_all(b"abc").await.unwrap();
        m2.write_all(b"defg").await.unwrap();

        assert_eq!(counters.bytes_written(), 7);
        assert_eq!(counters.bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_eof_passes_through() {
        let counters = Arc::new(TrafficCounters::new());
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut metered = MeteredStream::new(a, counters.clone());

        let mut buf = [0u8; 8];
        let n = metered.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(counters.bytes_read(), 0);
    }
}
