mod listener;
mod stats;

pub use stats::{format_bytes, format_duration};

use crate::admission::{AdmissionListener, AdmissionPolicy, LoadFn};
use crate::config::Config;
use crate::context::{ContextRegistry, RequestContext};
use crate::error::{Result, TunnelError};
use crate::eventlog::EventLog;
use crate::forwarder::Forwarder;
use crate::group::TaskGroup;
use crate::stats::{unix_now, ServerStats, StatsSnapshot};
use crate::tls::TlsContext;
use crate::tunnel::{Handler, Tunnel, TunnelHandler};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 事件日志容量
const EVENT_LOG_CAPACITY: usize = 100;

/// 进程内共享状态（避免过度克隆）
///
/// 服务器、隧道与处理器都持有同一个 `Arc<Shared>`
pub struct Shared {
    config: RwLock<Arc<Config>>,
    tls: RwLock<Option<Arc<TlsContext>>>,
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    pub(crate) forwarder: Forwarder,
    pub(crate) group: TaskGroup,
    pub(crate) registry: ContextRegistry,
    pub(crate) stats: ServerStats,
    pub(crate) events: EventLog,
    started: AtomicU64,
}

impl Shared {
    fn new(config: Config, tls: Option<Arc<TlsContext>>) -> Arc<Self> {
        let group = TaskGroup::new(config.limits.max_tasks);
        let forwarder = Forwarder::new(config.limits.max_forwards, group.clone());
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            tls: RwLock::new(tls),
            tunnels: RwLock::new(HashMap::new()),
            forwarder,
            group,
            registry: ContextRegistry::new(),
            stats: ServerStats::new(),
            events: EventLog::new(EVENT_LOG_CAPACITY),
            started: AtomicU64::new(0),
        })
    }

    /// 当前配置快照
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// 当前 TLS 上下文；`None` 表示以明文运行
    pub fn tls(&self) -> Option<Arc<TlsContext>> {
        self.tls.read().clone()
    }

    /// 领取一个按请求超时约束的上下文；关闭后返回 `None`
    pub fn context(&self) -> Option<RequestContext> {
        let timeout = self.config.read().request_timeout();
        self.registry.with_timeout(timeout)
    }

    pub fn tunnel(&self, peer_name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(peer_name).cloned()
    }

    /// 查找隧道，不存在时创建并启动（对端拨入未配置的 peer 时）
    pub fn tunnel_or_create(self: &Arc<Self>, peer_name: &str) -> Result<Arc<Tunnel>> {
        if let Some(tunnel) = self.tunnel(peer_name) {
            return Ok(tunnel);
        }
        if self.group.is_closed() {
            return Err(TunnelError::ShuttingDown);
        }

        let tunnel = {
            let mut tunnels = self.tunnels.write();
            if let Some(tunnel) = tunnels.get(peer_name) {
                return Ok(tunnel.clone());
            }
            let tunnel = Tunnel::new(peer_name, self.clone());
            tunnels.insert(peer_name.to_string(), tunnel.clone());
            tunnel
        };
        tunnel.start()?;
        Ok(tunnel)
    }

    /// 汇总统计快照
    pub fn snapshot(&self, recent_events: usize) -> StatsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let mut tunnels: Vec<_> = self.tunnels.read().values().map(|t| t.stats()).collect();
        tunnels.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));

        StatsSnapshot {
            peer_name: self.config.read().peer_name.clone(),
            started,
            uptime_secs: if started == 0 {
                0
            } else {
                unix_now().saturating_sub(started)
            },
            counters: self.stats.counters(),
            forwards: self.forwarder.count(),
            tasks: self.group.running(),
            tunnels,
            events: self.events.recent(recent_events),
        }
    }
}

/// 服务器：持有所有监听器与隧道，负责启动与关闭顺序
pub struct Server {
    shared: Arc<Shared>,
    /// 监听器停止信号，关闭时最先触发
    stop: CancellationToken,
    listeners: Mutex<BTreeMap<String, SocketAddr>>,
    admission: Mutex<Option<Arc<AdmissionListener>>>,
}

impl Server {
    /// 按配置创建服务器；TLS 材料在此加载，失败即返回错误
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let tls = match config.tls {
            Some(ref tls) => Some(TlsContext::load(tls).context("Failed to load TLS materials")?),
            None => None,
        };
        Ok(Self {
            shared: Shared::new(config, tls),
            stop: CancellationToken::new(),
            listeners: Mutex::new(BTreeMap::new()),
            admission: Mutex::new(None),
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// 按启动顺序打开监听器并启动隧道
    ///
    /// 任何配置的监听地址绑定失败都会直接返回错误
    pub async fn start(&self) -> anyhow::Result<()> {
        let config = self.shared.config();

        // 1. mux 监听器（准入控制）
        if let Some(ref addr) = config.listen {
            let inner = bind(addr, "mux").await?;
            let stats = self.shared.clone();
            let load: LoadFn = Arc::new(move || stats.stats.load());
            let listener = Arc::new(AdmissionListener::with_counters(
                inner,
                AdmissionPolicy::from(&config.admission),
                load,
                self.shared.stats.admission.clone(),
            ));
            self.record("mux", listener.local_addr()?);
            *self.admission.lock() = Some(listener.clone());

            let shared = self.shared.clone();
            let stop = self.stop.child_token();
            self.shared
                .group
                .go("mux-listener", listener::serve_mux(shared, listener, stop))?;
        }

        // 2. 统计信息监听器
        if let Some(ref addr) = config.http_listen {
            let inner = bind(addr, "stats").await?;
            self.record("stats", inner.local_addr()?);

            let shared = self.shared.clone();
            let stop = self.stop.child_token();
            self.shared
                .group
                .go("stats-listener", stats::serve_stats(shared, inner, stop))?;
        }

        // 3. 每个配置的隧道（以及它的本地转发监听器）
        for (name, peer) in &config.peers {
            let tunnel = self.shared.tunnel_or_create(name)?;
            if let Some(ref addr) = peer.listen {
                let inner = bind(addr, &format!("forward for '{}'", name)).await?;
                self.record(&format!("forward:{}", name), inner.local_addr()?);

                let shared = self.shared.clone();
                let handler = Handler::Tunnel(TunnelHandler::new(tunnel));
                let stop = self.stop.child_token();
                self.shared.group.go(
                    "forward-listener",
                    listener::serve_forward(shared, inner, handler, stop),
                )?;
            }
        }

        self.shared.started.store(unix_now(), Ordering::Relaxed);
        info!(
            "Peer '{}' started with {} tunnel(s)",
            config.peer_name,
            config.peers.len()
        );
        self.shared.events.add("started");
        Ok(())
    }

    fn record(&self, name: &str, addr: SocketAddr) {
        self.listeners.lock().insert(name.to_string(), addr);
    }

    /// mux 监听器的实际地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.lock().get("mux").copied()
    }

    /// 统计信息监听器的实际地址
    pub fn stats_addr(&self) -> Option<SocketAddr> {
        self.listeners.lock().get("stats").copied()
    }

    /// 指定隧道本地转发监听器的实际地址
    pub fn forward_addr(&self, peer_name: &str) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .get(&format!("forward:{}", peer_name))
            .copied()
    }

    pub fn tunnel(&self, peer_name: &str) -> Option<Arc<Tunnel>> {
        self.shared.tunnel(peer_name)
    }

    /// 加载新的配置快照
    ///
    /// 先构建新的 TLS 上下文，失败时保持现有配置不变。
    /// peer 表不支持运行时重定义：始终沿用当前快照中的 `peers`。
    pub fn load_config(&self, mut config: Config) -> anyhow::Result<()> {
        config.validate()?;
        let tls = match config.tls {
            Some(ref tls) => Some(TlsContext::load(tls).context("Failed to load TLS materials")?),
            None => None,
        };

        let current = self.shared.config();
        if config.peer_name != current.peer_name {
            warn!(
                "peer_name changed from '{}' to '{}', new handshakes will use the new name",
                current.peer_name, config.peer_name
            );
        }
        if !same_peers(&config, &current) {
            warn!("Changes to [peers] require a restart and were ignored");
        }
        config.peers = current.peers.clone();

        if let Some(ref listener) = *self.admission.lock() {
            listener.set_policy(AdmissionPolicy::from(&config.admission));
        }

        *self.shared.tls.write() = tls;
        *self.shared.config.write() = Arc::new(config);

        info!("Configuration reloaded");
        self.shared.events.add("configuration reloaded");
        Ok(())
    }

    /// 当前统计快照
    pub fn snapshot(&self) -> StatsSnapshot {
        self.shared.snapshot(EVENT_LOG_CAPACITY)
    }

    /// 关闭：停止监听 → 取消未完成的上下文 → 关闭转发器 → 关闭任务组并等待
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shared.events.add("shutting down");

        self.stop.cancel();
        self.admission.lock().take();
        self.shared.registry.close();
        self.shared.forwarder.close();
        self.shared.group.close();
        self.shared.group.wait().await;

        // 隧道持有共享状态，清空以打破引用环
        let tunnels: Vec<_> = self.shared.tunnels.write().drain().collect();
        for (_, tunnel) in tunnels {
            tunnel.close_sessions();
        }
        info!("Shutdown complete");
    }
}

async fn bind(addr: &str, what: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} listener on {}", what, addr))
}

fn same_peers(a: &Config, b: &Config) -> bool {
    a.peers.len() == b.peers.len()
        && a.peers.iter().zip(b.peers.iter()).all(|((an, ap), (bn, bp))| {
            an == bn
                && ap.dial == bp.dial
                && ap.listen == bp.listen
                && ap.service == bp.service
                && ap.redial == bp.redial
        })
}
