use super::Shared;
use crate::admission::AdmissionListener;
use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::group::panic_message;
use crate::meter::MeteredStream;
use crate::mux::Session;
use crate::net;
use crate::protocol::{server_handshake, Message};
use crate::stats::GaugeGuard;
use crate::transport::{boxed, BoxedTransport};
use crate::tunnel::Handler;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yamux::Mode;

/// mux 监听循环：准入控制之后的每个连接都走一遍握手
pub(crate) async fn serve_mux(
    shared: Arc<Shared>,
    listener: Arc<AdmissionListener>,
    stop: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Mux listener on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                // 在派生任务之前计入半开连接，准入控制对下一个连接立即可见
                let half_open = GaugeGuard::new(&shared.stats.half_open);
                let conn_shared = shared.clone();
                let spawned = shared.group.go("handshake", async move {
                    let serve = serve_inbound(&conn_shared, stream, addr, half_open);
                    serve_one(&conn_shared, addr, serve).await;
                });
                if let Err(e) = spawned {
                    debug!("Dropping connection from {}: {}", addr, e);
                }
            }
            Err(e) => {
                warn!("Mux listener accept failed: {}", e);
                break;
            }
        }
    }

    debug!("Mux listener stopped");
}

/// 本地转发监听循环：接受的连接经隧道送往对端
pub(crate) async fn serve_forward(
    shared: Arc<Shared>,
    listener: TcpListener,
    handler: Handler,
    stop: CancellationToken,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    info!("Forward listener on {}", local);

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                net::set_tcp_options(&stream, &shared.config().tcp);
                let conn_shared = shared.clone();
                let handler = handler.clone();
                let spawned = shared.group.go("forward-accept", async move {
                    let label = format!("connection from {}", addr);
                    let serve = handler.serve(&conn_shared, boxed(stream), &label);
                    serve_one(&conn_shared, addr, serve).await;
                });
                if let Err(e) = spawned {
                    debug!("Dropping connection from {}: {}", addr, e);
                }
            }
            Err(e) => {
                warn!("Forward listener {} accept failed: {}", local, e);
                break;
            }
        }
    }

    debug!("Forward listener {} stopped", local);
}

/// 在关闭前提下运行单个连接的处理，并捕获 panic
async fn serve_one<F>(shared: &Shared, addr: SocketAddr, serve: F)
where
    F: std::future::Future<Output = ()>,
{
    if shared.registry.is_closed() {
        return;
    }
    if let Err(panic) = AssertUnwindSafe(serve).catch_unwind().await {
        error!(
            "Panic while serving {}: {}",
            addr,
            panic_message(panic.as_ref())
        );
    }
}

/// 入站连接：TLS、握手、创建会话并交给对应隧道
async fn serve_inbound(
    shared: &Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    half_open: GaugeGuard,
) {
    let Some(ctx) = shared.context() else {
        return;
    };

    let config = shared.config();
    net::set_tcp_options(&stream, &config.tcp);
    let metered = MeteredStream::new(stream, shared.stats.traffic.clone());

    let result = ctx
        .run(accept_handshake(shared, &config, metered))
        .await
        .and_then(|r| r);
    drop(ctx);
    drop(half_open);

    let (io, request) = match result {
        Ok(v) => v,
        Err(e) if e.is_shutdown() => return,
        Err(e) => {
            info!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    shared.stats.authorized.fetch_add(1, Ordering::Relaxed);
    debug!(
        "Peer '{}' from {} authorized (service: {:?})",
        request.peer_name, addr, request.service
    );

    let session = Session::new(io, &config.mux, Mode::Server);
    let handler = Handler::for_service(shared, &request.service);
    if handler.is_empty() {
        debug!(
            "Peer '{}' requested unknown service {:?}, refusing its streams",
            request.peer_name, request.service
        );
        session.go_away();
    }

    let tunnel = match shared.tunnel_or_create(&request.peer_name) {
        Ok(tunnel) => tunnel,
        Err(e) => {
            debug!("Dropping session from '{}': {}", request.peer_name, e);
            session.close();
            return;
        }
    };
    if let Err(e) = tunnel.serve_session(session, handler, format!("<- {}", addr)) {
        warn!("Failed to serve session from '{}': {}", request.peer_name, e);
    }
}

async fn accept_handshake(
    shared: &Shared,
    config: &Config,
    metered: MeteredStream<TcpStream>,
) -> Result<(BoxedTransport, Message)> {
    let mut io = match shared.tls() {
        Some(tls) => {
            let stream = tls
                .acceptor
                .accept(metered)
                .await
                .map_err(|e| TunnelError::Tls(e.to_string()))?;
            boxed(stream)
        }
        None => boxed(metered),
    };

    // 请求中的服务由本端提供；回复中的服务是本端希望对端为我们打开的子流提供的，
    // 取自本端为该 peer 配置的 `service`，未配置时为空
    let (request, _) = server_handshake(&mut io, |request| {
        let service = config
            .peers
            .get(&request.peer_name)
            .map(|peer| peer.service.clone())
            .unwrap_or_default();
        Message::new(config.peer_name.clone(), service)
    })
    .await?;

    if request.peer_name.trim().is_empty() {
        return Err(TunnelError::protocol("empty peer name"));
    }
    Ok((io, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionPolicy, LoadFn};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_half_open_counted_before_handshake_task() {
        let shared = Shared::new(Config::new("bob"), None);
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let load_source = shared.clone();
        let load: LoadFn = Arc::new(move || load_source.stats.load());
        // 只允许一个半开连接
        let policy = AdmissionPolicy {
            start: 1,
            full: 1,
            rate: 1.0,
            max_sessions: 0,
        };
        let listener = Arc::new(AdmissionListener::with_counters(
            inner,
            policy,
            load,
            shared.stats.admission.clone(),
        ));
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let serving = tokio::spawn(serve_mux(shared.clone(), listener, stop.clone()));

        // 两个连接都不发送握手，紧接着到达
        let _first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        wait_for(|| shared.stats.counters().accepted == 2).await;
        let counters = shared.stats.counters();
        assert_eq!(counters.served, 1);
        assert_eq!(counters.half_open, 1);

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("rejected connection should be closed");
        assert!(matches!(result, Ok(0) | Err(_)));

        stop.cancel();
        shared.registry.close();
        shared.group.close();
        tokio::time::timeout(Duration::from_secs(5), shared.group.wait())
            .await
            .expect("handshake task should stop");
        serving.await.unwrap();
        assert_eq!(shared.stats.counters().half_open, 0);
    }
}
