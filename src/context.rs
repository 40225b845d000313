/// 可取消操作注册表
///
/// 每次握手、每次拨号都从这里领取一个带截止时间的上下文。
/// 关闭时一次性取消所有未完成的上下文，并拒绝再发放新的上下文。
use crate::error::{Result, TunnelError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RegistryState {
    closed: bool,
    next_id: u64,
    contexts: HashMap<u64, CancellationToken>,
}

/// 上下文注册表
#[derive(Clone, Default)]
pub struct ContextRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 领取一个带超时的上下文；注册表已关闭时返回 None
    pub fn with_timeout(&self, timeout: Duration) -> Option<RequestContext> {
        let token = CancellationToken::new();
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.contexts.insert(id, token.clone());
            id
        };

        Some(RequestContext {
            id,
            token,
            timeout,
            deadline: Instant::now() + timeout,
            registry: Arc::downgrade(&self.state),
        })
    }

    /// 取消全部上下文，之后不再发放新上下文（幂等）
    pub fn close(&self) {
        let contexts = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.contexts)
        };
        for token in contexts.into_values() {
            token.cancel();
        }
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 未完成的上下文数量
    pub fn len(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单次操作的上下文，drop 时自动从注册表移除
pub struct RequestContext {
    id: u64,
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    registry: Weak<Mutex<RegistryState>>,
}

impl RequestContext {
    /// 是否已被取消
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 在截止时间与取消信号的约束下运行 `fut`
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(TunnelError::Canceled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| TunnelError::timeout(self.timeout))
            }
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if let Some(state) = self.registry.upgrade() {
            state.lock().contexts.remove(&self.id);
        }
    }
}
