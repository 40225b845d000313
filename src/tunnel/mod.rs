/// 隧道：与一个具名 peer 的逻辑关系
///
/// 隧道不绑定任何一条物理连接。它持有零个或多个会话（本端拨出与对端拨入可能同时成功，
/// 两者都会被服务），运行重连循环，并把会话产生的每个子流交给处理器。
mod backoff;
mod handler;

pub use backoff::{backoff, BACKOFF_TABLE};
pub use handler::{ForwardHandler, Handler, TunnelHandler};

use crate::config::{Config, PeerConfig};
use crate::context::RequestContext;
use crate::error::{Result, TunnelError};
use crate::meter::MeteredStream;
use crate::mux::{MuxStream, Session};
use crate::net;
use crate::protocol::{client_handshake, Message};
use crate::server::Shared;
use crate::stats::{unix_now, GaugeGuard, TunnelStats};
use crate::tls::TlsContext;
use crate::transport::{boxed, BoxedTransport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use yamux::Mode;

struct SessionEntry {
    session: Arc<Session>,
    /// 日志用的可读标签
    tag: String,
}

pub struct Tunnel {
    peer_name: String,
    shared: Arc<Shared>,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    /// 同一时刻最多一个出站拨号
    dial_lock: tokio::sync::Mutex<()>,
    redial_count: AtomicUsize,
    last_changed: AtomicU64,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Tunnel {
    pub fn new(peer_name: impl Into<String>, shared: Arc<Shared>) -> Arc<Self> {
        // 只保留一个待处理的唤醒
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Arc::new(Self {
            peer_name: peer_name.into(),
            shared,
            sessions: Mutex::new(HashMap::new()),
            dial_lock: tokio::sync::Mutex::new(()),
            redial_count: AtomicUsize::new(0),
            last_changed: AtomicU64::new(unix_now()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// 当前快照中本隧道的定义；对端拨入时按需创建的隧道没有定义
    fn peer_config(&self, config: &Config) -> PeerConfig {
        config
            .peers
            .get(&self.peer_name)
            .cloned()
            .unwrap_or_else(|| PeerConfig {
                redial: false,
                ..PeerConfig::default()
            })
    }

    /// 启动重连循环（只会启动一次）
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(wake_rx) = self.wake_rx.lock().take() else {
            return Ok(());
        };
        let tunnel = self.clone();
        self.shared.group.go("redial", tunnel.run(wake_rx))
    }

    /// 唤醒重连循环，跳过当前等待；多次唤醒合并为一次
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// 返回一个可用的会话，顺带清理已关闭的会话
    pub fn session(&self) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.session.is_closed());
        if sessions.len() != before {
            self.touch();
        }
        sessions.values().next().map(|entry| entry.session.clone())
    }

    pub fn num_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, entry| !entry.session.is_closed());
        sessions.len()
    }

    fn add_session(&self, session: Arc<Session>, tag: String) {
        info!("Tunnel '{}': session {} up", self.peer_name, tag);
        self.shared
            .events
            .add(format!("{}: session {} up", self.peer_name, tag));
        self.sessions
            .lock()
            .insert(session.id(), SessionEntry { session, tag });
        self.touch();
    }

    fn remove_session(&self, id: u64) {
        let removed = self.sessions.lock().remove(&id);
        if let Some(entry) = removed {
            info!("Tunnel '{}': session {} down", self.peer_name, entry.tag);
            self.shared
                .events
                .add(format!("{}: session {} down", self.peer_name, entry.tag));
            self.touch();
        }
    }

    fn touch(&self) {
        self.last_changed.store(unix_now(), Ordering::Relaxed);
    }

    /// 建立出站会话
    ///
    /// 已有拨号进行中时返回 `DialInProgress`，未配置拨号地址时返回 `NoDialAddress`，
    /// 两者都不是故障。
    pub async fn dial(self: &Arc<Self>, ctx: &RequestContext) -> Result<Arc<Session>> {
        let _dialing = self
            .dial_lock
            .try_lock()
            .map_err(|_| TunnelError::DialInProgress)?;

        // 拿到锁后再查一次，避免与刚建立的入站会话重复
        if let Some(session) = self.session() {
            return Ok(session);
        }

        let config = self.shared.config();
        let peer = self.peer_config(&config);
        let addr = peer.dial.clone().ok_or(TunnelError::NoDialAddress)?;

        debug!("Tunnel '{}': dialing {}", self.peer_name, addr);
        let tls = self.shared.tls();
        let (io, reply) = ctx
            .run(self.connect(&config, &addr, &peer, tls))
            .await??;

        let session = Session::new(io, &config.mux, Mode::Client);
        let handler = Handler::for_service(&self.shared, &reply.service);
        if handler.is_empty() {
            debug!(
                "Tunnel '{}': no local service for '{}', refusing peer streams",
                self.peer_name, reply.service
            );
            session.go_away();
        }

        let tag = format!("-> {}", addr);
        self.serve_session(session.clone(), handler, tag)?;
        Ok(session)
    }

    /// TCP 连接、TLS 握手与应用层握手，整体受调用方上下文的截止时间约束
    async fn connect(
        &self,
        config: &Config,
        addr: &str,
        peer: &PeerConfig,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<(BoxedTransport, Message)> {
        let stream = net::connect(addr, &config.tcp).await?;
        let metered = MeteredStream::new(stream, self.shared.stats.traffic.clone());

        let mut io = match tls {
            Some(tls) => {
                let server_name = tls.server_name_for(addr)?;
                let stream = tls
                    .connector
                    .connect(server_name, metered)
                    .await
                    .map_err(|e| TunnelError::Tls(e.to_string()))?;
                boxed(stream)
            }
            None => {
                warn!(
                    "Tunnel '{}': TLS is disabled, connecting to {} in plaintext",
                    self.peer_name, addr
                );
                boxed(metered)
            }
        };

        let request = Message::new(config.peer_name.clone(), peer.service.clone());
        let reply = client_handshake(&mut io, &request).await?;
        if reply.peer_name != self.peer_name {
            return Err(TunnelError::protocol(format!(
                "expected peer '{}', got '{}'",
                self.peer_name, reply.peer_name
            )));
        }
        Ok((io, reply))
    }

    /// 登记会话并在任务组中服务其子流；会话结束后注销并唤醒重连循环
    pub fn serve_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        handler: Handler,
        tag: String,
    ) -> Result<()> {
        let id = session.id();
        self.add_session(session.clone(), tag);

        let tunnel = self.clone();
        let serving = session.clone();
        let spawned = self.shared.group.go("session", async move {
            let _live = GaugeGuard::new(&tunnel.shared.stats.sessions);
            tunnel.serve_streams(&serving, &handler).await;
            serving.close();
            tunnel.remove_session(serving.id());
            tunnel.wake();
        });

        if let Err(e) = spawned {
            session.close();
            self.remove_session(id);
            return Err(e);
        }
        Ok(())
    }

    async fn serve_streams(&self, session: &Session, handler: &Handler) {
        let shutdown = self.shared.group.close_signal();
        loop {
            let accepted = tokio::select! {
                accepted = session.accept() => accepted,
                _ = shutdown.cancelled() => return,
            };

            let stream = match accepted {
                Ok(stream) => stream,
                Err(TunnelError::SessionClosed) => {
                    debug!("Tunnel '{}': session {} closed", self.peer_name, session.id());
                    return;
                }
                Err(e) => {
                    warn!("Tunnel '{}': accept failed: {}", self.peer_name, e);
                    return;
                }
            };

            let label = format!("stream {} from '{}'", stream.id(), self.peer_name);
            let handler = handler.clone();
            let shared = self.shared.clone();
            let spawned = self.shared.group.go("stream", async move {
                handler.serve(&shared, boxed(stream), &label).await;
            });
            if let Err(e) = spawned {
                debug!("Tunnel '{}': dropping stream: {}", self.peer_name, e);
            }
        }
    }

    /// 打开一个到对端的子流；没有会话时同步拨号
    pub async fn mux_dial(self: &Arc<Self>, ctx: &RequestContext) -> Result<MuxStream> {
        self.shared.stats.request.fetch_add(1, Ordering::Relaxed);
        let session = match self.session() {
            Some(session) => session,
            None => self.dial(ctx).await?,
        };
        let stream = ctx.run(session.open()).await??;
        self.shared.stats.success.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// 是否应由重连循环主动拨号
    fn wants_redial(&self) -> bool {
        let config = self.shared.config();
        let peer = self.peer_config(&config);
        peer.redial && peer.dial.is_some() && self.session().is_none()
    }

    async fn run(self: Arc<Self>, mut wake: mpsc::Receiver<()>) {
        let shutdown = self.shared.group.close_signal();
        debug!("Tunnel '{}': redial loop started", self.peer_name);

        loop {
            if self.wants_redial() {
                self.redial_once().await;
            }

            let wait = self
                .wants_redial()
                .then(|| backoff(self.redial_count.load(Ordering::Relaxed)));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.recv() => {}
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
            }
        }

        self.close_sessions();
        debug!("Tunnel '{}': redial loop stopped", self.peer_name);
    }

    async fn redial_once(self: &Arc<Self>) {
        let Some(ctx) = self.shared.context() else {
            return;
        };
        match self.dial(&ctx).await {
            Ok(_) => {
                self.redial_count.store(0, Ordering::Relaxed);
            }
            Err(e) if e.is_benign_dial() => {
                debug!("Tunnel '{}': {}", self.peer_name, e);
            }
            Err(e) if e.is_shutdown() => {}
            Err(e) => {
                let attempt = self.redial_count.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Tunnel '{}': dial attempt {} failed: {}",
                    self.peer_name, attempt, e
                );
                self.shared
                    .events
                    .add(format!("{}: dial failed: {}", self.peer_name, e));
            }
        }
    }

    /// 关闭全部会话
    pub fn close_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().collect();
        for (_, entry) in sessions {
            entry.session.close();
        }
        self.touch();
    }

    pub fn stats(&self) -> TunnelStats {
        let (sessions, streams) = {
            let mut map = self.sessions.lock();
            map.retain(|_, entry| !entry.session.is_closed());
            let streams = map.values().map(|e| e.session.num_streams()).sum();
            (map.len(), streams)
        };
        TunnelStats {
            peer_name: self.peer_name.clone(),
            sessions,
            streams,
            redial_count: self.redial_count.load(Ordering::Relaxed),
            last_changed: self.last_changed.load(Ordering::Relaxed),
        }
    }
}
