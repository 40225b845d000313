/// 子流 / 连接处理器
///
/// 封闭的三种处理方式：转发到本地服务、经隧道转发到对端、直接丢弃
use super::Tunnel;
use crate::error::TunnelError;
use crate::forwarder::Refused;
use crate::net;
use crate::server::Shared;
use crate::transport::{boxed, BoxedTransport};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub enum Handler {
    /// 转发到 `services` 中的本地服务
    Forward(ForwardHandler),
    /// 经隧道打开子流，转发到对端
    Tunnel(TunnelHandler),
    /// 拒绝：直接关闭
    Empty,
}

impl Handler {
    /// 按服务名构建处理器：服务可解析则转发，否则拒绝
    pub fn for_service(shared: &Shared, service: &str) -> Self {
        if shared.config().service_addr(service).is_some() {
            Handler::Forward(ForwardHandler {
                service: service.to_string(),
            })
        } else {
            Handler::Empty
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Handler::Empty)
    }

    /// 处理一条连接（子流或本地接受的 TCP 连接）
    pub async fn serve(&self, shared: &Arc<Shared>, conn: BoxedTransport, label: &str) {
        match self {
            Handler::Forward(h) => h.serve(shared, conn, label).await,
            Handler::Tunnel(h) => h.serve(shared, conn, label).await,
            Handler::Empty => debug!("Rejecting {}", label),
        }
    }
}

#[derive(Clone)]
pub struct ForwardHandler {
    service: String,
}

impl ForwardHandler {
    async fn serve(&self, shared: &Arc<Shared>, conn: BoxedTransport, label: &str) {
        // 每次都读取当前快照，服务表可随重载更新
        let config = shared.config();
        let Some(addr) = config.service_addr(&self.service) else {
            warn!("Service '{}' is no longer configured, dropping {}", self.service, label);
            return;
        };
        let Some(ctx) = shared.context() else {
            return;
        };

        let dialed = match ctx.run(net::connect(addr, &config.tcp)).await.and_then(|r| r) {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_shutdown() {
                    debug!("Dial to service '{}' canceled", self.service);
                } else {
                    warn!("Failed to reach service '{}' for {}: {}", self.service, label, e);
                }
                return;
            }
        };
        drop(ctx);

        debug!("Forwarding {} to service '{}' ({})", label, self.service, addr);
        forward(shared, conn, boxed(dialed));
    }
}

#[derive(Clone)]
pub struct TunnelHandler {
    tunnel: Arc<Tunnel>,
}

impl TunnelHandler {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        Self { tunnel }
    }

    async fn serve(&self, shared: &Arc<Shared>, conn: BoxedTransport, label: &str) {
        let Some(ctx) = shared.context() else {
            return;
        };
        let stream = match self.tunnel.mux_dial(&ctx).await {
            Ok(stream) => stream,
            Err(TunnelError::DialInProgress) => {
                debug!(
                    "Tunnel '{}' is still dialing, dropping {}",
                    self.tunnel.peer_name(),
                    label
                );
                return;
            }
            Err(e) if e.is_shutdown() => return,
            Err(e) => {
                warn!(
                    "Tunnel '{}' cannot carry {}: {}",
                    self.tunnel.peer_name(),
                    label,
                    e
                );
                return;
            }
        };
        drop(ctx);

        debug!(
            "Forwarding {} through tunnel '{}' (stream {})",
            label,
            self.tunnel.peer_name(),
            stream.id()
        );
        forward(shared, conn, boxed(stream));
    }
}

fn forward(shared: &Shared, accepted: BoxedTransport, dialed: BoxedTransport) {
    if let Err(Refused { error, .. }) = shared.forwarder.forward(accepted, dialed) {
        // 被拒绝的两端随 Refused 一起 drop，即关闭
        if error.is_shutdown() {
            debug!("Forward refused: {}", error);
        } else {
            warn!("Forward refused: {}", error);
        }
    }
}
