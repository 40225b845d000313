/// 双向转发器
///
/// 把一个接受的连接与一个拨出的连接配成一对，两个方向各由一个任务复制数据。
/// 任一方向结束时，两端一起关闭；清理（移出集合、释放名额）对每一对只发生一次。
use crate::error::TunnelError;
use crate::group::TaskGroup;
use crate::transport::BoxedTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 半关闭写端时最多等待的时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    closed: bool,
    next_id: u64,
    pairs: HashMap<u64, CancellationToken>,
}

struct Inner {
    limit: usize,
    group: TaskGroup,
    state: Mutex<State>,
    forwarded: AtomicU64,
    released: AtomicU64,
}

/// 转发器句柄，可廉价克隆
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<Inner>,
}

/// 转发被拒绝，原样交还两端连接，由调用方负责关闭
pub struct Refused {
    pub error: TunnelError,
    pub accepted: BoxedTransport,
    pub dialed: BoxedTransport,
}

impl std::fmt::Debug for Refused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refused").field("error", &self.error).finish()
    }
}

impl Forwarder {
    /// 创建转发器，`limit` 为同时进行的转发对上限
    pub fn new(limit: usize, group: TaskGroup) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                group,
                state: Mutex::new(State::default()),
                forwarded: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// 配对两端连接并开始双向复制
    ///
    /// 达到上限、任务组已满或已关闭时立即失败，且不触碰任何一端
    pub fn forward(
        &self,
        accepted: BoxedTransport,
        dialed: BoxedTransport,
    ) -> std::result::Result<(), Refused> {
        // 两个方向的任务名额要么都拿到，要么都不拿
        let first = match self.inner.group.slot() {
            Ok(slot) => slot,
            Err(error) => return Err(Refused { error, accepted, dialed }),
        };
        let second = match self.inner.group.slot() {
            Ok(slot) => slot,
            Err(error) => return Err(Refused { error, accepted, dialed }),
        };

        let token = CancellationToken::new();
        let id = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Refused {
                    error: TunnelError::ShuttingDown,
                    accepted,
                    dialed,
                });
            }
            if state.pairs.len() >= self.inner.limit {
                return Err(Refused {
                    error: TunnelError::ForwardLimit {
                        limit: self.inner.limit,
                    },
                    accepted,
                    dialed,
                });
            }
            state.next_id += 1;
            let id = state.next_id;
            state.pairs.insert(id, token.clone());
            id
        };
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);

        let pairing = Arc::new(Pairing {
            id,
            token,
            done: AtomicBool::new(false),
            forwarder: self.inner.clone(),
        });

        let (accepted_read, accepted_write) = tokio::io::split(accepted);
        let (dialed_read, dialed_write) = tokio::io::split(dialed);

        first.spawn(
            "forward",
            copy_half(
                accepted_read,
                dialed_write,
                "accepted->dialed",
                CleanupGuard(pairing.clone()),
            ),
        );
        second.spawn(
            "forward",
            copy_half(
                dialed_read,
                accepted_write,
                "dialed->accepted",
                CleanupGuard(pairing),
            ),
        );

        Ok(())
    }

    /// 强制关闭所有转发对，之后拒绝新的配对（幂等）
    pub fn close(&self) {
        let pairs = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.pairs)
        };
        if !pairs.is_empty() {
            debug!("Closing {} forwarding pairs", pairs.len());
        }
        for token in pairs.into_values() {
            token.cancel();
        }
    }

    /// 当前进行中的转发对数量
    pub fn count(&self) -> usize {
        self.inner.state.lock().pairs.len()
    }

    /// 累计建立的转发对数量
    pub fn forwarded(&self) -> u64 {
        self.inner.forwarded.load(Ordering::Relaxed)
    }

    /// 累计完成清理的转发对数量
    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::Relaxed)
    }
}

/// 一个转发对的共享清理状态
struct Pairing {
    id: u64,
    token: CancellationToken,
    done: AtomicBool,
    forwarder: Arc<Inner>,
}

impl Pairing {
    fn finish(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        self.forwarder.state.lock().pairs.remove(&self.id);
        self.forwarder.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// 任务退出（包括 panic 展开）时触发清理
struct CleanupGuard(Arc<Pairing>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, direction: &'static str, guard: CleanupGuard)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let token = guard.0.token.clone();
    let result = tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => Some(result),
        _ = token.cancelled() => None,
    };

    match result {
        Some(Ok(bytes)) => debug!("Forward {} finished after {} bytes", direction, bytes),
        Some(Err(e)) if is_closed_error(&e) => {
            debug!("Forward {} closed: {}", direction, e)
        }
        Some(Err(e)) => warn!("Forward {} failed: {}", direction, e),
        None => {}
    }

    // 先通知另一方向退出，再关闭本方向写端
    drop(guard);
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
}

/// 是否为正常拆除导致的 I/O 错误
pub fn is_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::boxed;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};

    fn pipe() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(8 * 1024)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_forward_copies_both_directions() {
        let forwarder = Forwarder::new(8, TaskGroup::new(16));
        let (mut client, accepted) = pipe();
        let (dialed, mut backend) = pipe();

        forwarder.forward(boxed(accepted), boxed(dialed)).unwrap();
        assert_eq!(forwarder.count(), 1);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_close_one_side_closes_both() {
        let group = TaskGroup::new(16);
        let forwarder = Forwarder::new(8, group.clone());
        let (client, accepted) = pipe();
        let (dialed, mut backend) = pipe();

        forwarder.forward(boxed(accepted), boxed(dialed)).unwrap();
        drop(client);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), backend.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        wait_until(|| forwarder.count() == 0).await;
        wait_until(|| group.running() == 0).await;
        assert_eq!(forwarder.released(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_cleans_up_once() {
        let group = TaskGroup::new(256);
        let forwarder = Forwarder::new(64, group.clone());

        for _ in 0..50 {
            let (client, accepted) = pipe();
            let (dialed, backend) = pipe();
            forwarder.forward(boxed(accepted), boxed(dialed)).unwrap();

            let a = tokio::spawn(async move { drop(client) });
            let b = tokio::spawn(async move { drop(backend) });
            a.await.unwrap();
            b.await.unwrap();
        }

        wait_until(|| forwarder.count() == 0).await;
        wait_until(|| group.running() == 0).await;
        assert_eq!(forwarder.forwarded(), 50);
        assert_eq!(forwarder.released(), 50);
    }

    #[tokio::test]
    async fn test_limit_refuses_without_touching_connections() {
        let forwarder = Forwarder::new(2, TaskGroup::new(16));
        let mut keep = Vec::new();
        for _ in 0..2 {
            let (client, accepted) = pipe();
            let (dialed, backend) = pipe();
            forwarder.forward(boxed(accepted), boxed(dialed)).unwrap();
            keep.push((client, backend));
        }

        let (mut client, accepted) = pipe();
        let (dialed, _backend) = pipe();
        let refused = forwarder
            .forward(boxed(accepted), boxed(dialed))
            .unwrap_err();
        assert!(matches!(refused.error, TunnelError::ForwardLimit { limit: 2 }));
        assert_eq!(forwarder.count(), 2);

        // 被交还的连接仍然可用
        let mut accepted = refused.accepted;
        accepted.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_group_full_refuses() {
        // 只有一个名额，无法同时派生两个方向
        let forwarder = Forwarder::new(8, TaskGroup::new(1));
        let (_client, accepted) = pipe();
        let (dialed, _backend) = pipe();
        let refused = forwarder
            .forward(boxed(accepted), boxed(dialed))
            .unwrap_err();
        assert!(matches!(refused.error, TunnelError::GroupFull));
        assert_eq!(forwarder.count(), 0);
    }

    #[tokio::test]
    async fn test_close_forces_pairs_down() {
        let forwarder = Forwarder::new(8, TaskGroup::new(16));
        let (_client, accepted) = pipe();
        let (dialed, mut backend) = pipe();
        forwarder.forward(boxed(accepted), boxed(dialed)).unwrap();

        forwarder.close();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), backend.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(forwarder.count(), 0);

        let (_c, accepted) = pipe();
        let (dialed, _b) = pipe();
        let refused = forwarder
            .forward(boxed(accepted), boxed(dialed))
            .unwrap_err();
        assert!(matches!(refused.error, TunnelError::ShuttingDown));
    }

    /// 读取时 panic 的连接
    struct Exploding;

    impl AsyncRead for Exploding {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            panic!("read exploded")
        }
    }

    impl AsyncWrite for Exploding {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_panic_in_copy_still_cleans_up() {
        let group = TaskGroup::new(16);
        let forwarder = Forwarder::new(8, group.clone());
        let (dialed, mut backend) = pipe();

        forwarder.forward(boxed(Exploding), boxed(dialed)).unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), backend.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        wait_until(|| forwarder.count() == 0).await;
        wait_until(|| group.running() == 0).await;
        assert_eq!(forwarder.released(), 1);
    }
}
