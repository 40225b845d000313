/// TCP 连接参数
use crate::config::TcpConfig;
use crate::error::{Result, TunnelError};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

/// 应用 nodelay 与 keepalive；失败只记录警告，不影响连接
pub fn set_tcp_options(stream: &TcpStream, config: &TcpConfig) {
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer_of(stream), e);
    }
    apply_keepalive(stream, config);
}

fn apply_keepalive(stream: &TcpStream, config: &TcpConfig) {
    if config.keepalive_secs.is_none() && config.keepalive_interval_secs.is_none() {
        return;
    }

    let mut keepalive = TcpKeepalive::new();
    if let Some(secs) = config.keepalive_secs {
        keepalive = keepalive.with_time(Duration::from_secs(secs));
    }
    if let Some(secs) = config.keepalive_interval_secs {
        keepalive = keepalive.with_interval(Duration::from_secs(secs));
    }

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive on {}: {}", peer_of(stream), e);
    }
}

/// 建立 TCP 连接并应用连接参数
pub async fn connect(addr: &str, config: &TcpConfig) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TunnelError::connection_failed(addr, e))?;
    set_tcp_options(&stream, config);
    Ok(stream)
}

fn peer_of(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into())
}
