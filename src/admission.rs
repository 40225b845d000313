/// 准入控制监听器
///
/// 包装原始 TCP 监听器，根据当前"半开"连接数（已接受但未完成握手）与已认证会话数，
/// 概率性或强制地丢弃新连接，防止握手路径被耗尽。
///
/// 决策读取的两个计数器分别独立更新，没有一致快照；
/// 对于概率性软限制，瞬时的组合偏差是可接受的。
use crate::config::AdmissionConfig;
use parking_lot::RwLock;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// 返回当前 (会话数, 半开连接数)
pub type LoadFn = Arc<dyn Fn() -> (usize, usize) + Send + Sync>;

/// 准入决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// 已认证会话达到上限
    RejectSessions,
    /// 半开连接达到硬阈值
    RejectFull,
    /// 超过软阈值后按概率丢弃
    RejectRandom,
}

impl Admission {
    pub fn is_accept(self) -> bool {
        self == Admission::Accept
    }
}

/// 准入策略（纯函数，便于测试）
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub start: usize,
    pub full: usize,
    pub rate: f64,
    pub max_sessions: usize,
}

impl From<&AdmissionConfig> for AdmissionPolicy {
    fn from(cfg: &AdmissionConfig) -> Self {
        Self {
            start: cfg.start,
            full: cfg.full,
            rate: cfg.rate,
            max_sessions: cfg.max_sessions,
        }
    }
}

impl AdmissionPolicy {
    /// 对一个新连接作出决策
    pub fn decide<R: Rng>(&self, sessions: usize, half_open: usize, rng: &mut R) -> Admission {
        if self.max_sessions > 0 && sessions >= self.max_sessions {
            return Admission::RejectSessions;
        }
        if half_open >= self.full {
            return Admission::RejectFull;
        }
        if half_open >= self.start && rng.random::<f64>() < self.rate {
            return Admission::RejectRandom;
        }
        Admission::Accept
    }
}

/// 监听器的单调计数，只用于观测，不参与决策
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    accepted: AtomicU64,
    served: AtomicU64,
}

impl AdmissionCounters {
    /// 从操作系统接受的连接总数
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// 通过准入的连接总数
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

/// 带准入控制的监听器
pub struct AdmissionListener {
    inner: TcpListener,
    policy: RwLock<AdmissionPolicy>,
    load: LoadFn,
    counters: Arc<AdmissionCounters>,
}

impl AdmissionListener {
    pub fn new(inner: TcpListener, policy: AdmissionPolicy, load: LoadFn) -> Self {
        Self::with_counters(inner, policy, load, Arc::default())
    }

    /// 使用外部共享的计数器（例如进程级统计）
    pub fn with_counters(
        inner: TcpListener,
        policy: AdmissionPolicy,
        load: LoadFn,
        counters: Arc<AdmissionCounters>,
    ) -> Self {
        Self {
            inner,
            policy: RwLock::new(policy),
            load,
            counters,
        }
    }

    /// 替换准入策略，对之后接受的连接生效
    pub fn set_policy(&self, policy: AdmissionPolicy) {
        *self.policy.write() = policy;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// 接受下一个通过准入的连接；被拒绝的连接直接关闭，不作为错误返回
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            let (stream, addr) = self.inner.accept().await?;
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);

            let (sessions, half_open) = (self.load)();
            let decision = self
                .policy
                .read()
                .decide(sessions, half_open, &mut rand::rng());
            if decision.is_accept() {
                self.counters.served.fetch_add(1, Ordering::Relaxed);
                return Ok((stream, addr));
            }

            debug!(
                "Rejected connection from {} ({:?}, sessions={}, half_open={})",
                addr, decision, sessions, half_open
            );
            drop(stream);
        }
    }

    pub fn counters(&self) -> &Arc<AdmissionCounters> {
        &self.counters
    }
}
