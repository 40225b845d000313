/// 有界任务组
///
/// 进程内所有长期任务（会话服务循环、重连循环、转发方向）都经由同一个任务组派生。
/// 任务组有硬性并发上限，超出时 `go` 直接返回 `GroupFull`，由调用方决定丢弃或重试。
use crate::error::{Result, TunnelError};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

struct GroupInner {
    limit: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// 任务组句柄，可廉价克隆
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

/// 预留的一个任务名额
pub struct Slot {
    permit: OwnedSemaphorePermit,
    group: TaskGroup,
}

impl TaskGroup {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                limit,
                permits: Arc::new(Semaphore::new(limit)),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 预留一个名额（不派生任务）
    pub fn slot(&self) -> Result<Slot> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TunnelError::ShuttingDown);
        }
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| TunnelError::GroupFull)?;
        Ok(Slot {
            permit,
            group: self.clone(),
        })
    }

    /// 派生一个受监管的任务
    pub fn go<F>(&self, name: &'static str, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.slot()?.spawn(name, fut);
        Ok(())
    }

    /// 关闭广播信号，所有长期循环都应监听它
    pub fn close_signal(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// 当前运行中的任务数
    pub fn running(&self) -> usize {
        self.inner.limit - self.inner.permits.available_permits()
    }

    /// 发出关闭信号，不再接受新任务
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
    }

    /// 等待所有任务退出（需先调用 `close`）
    pub async fn wait(&self) {
        self.inner.tracker.wait().await
    }
}

impl Slot {
    /// 使用预留名额派生任务；任务 panic 会被捕获并记录，名额照常释放
    pub fn spawn<F>(self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.permit;
        self.group.inner.tracker.spawn(async move {
            let _permit = permit;
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(
                    "Task '{}' panicked: {}",
                    name,
                    panic_message(panic.as_ref())
                );
            }
        });
    }
}

/// 提取 panic 负载中的文本
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
