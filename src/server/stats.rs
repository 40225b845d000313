use super::Shared;
use crate::stats::StatsSnapshot;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单个统计请求的读写超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 统计页面展示的事件条数
const RECENT_EVENTS: usize = 20;

/// 运行统计数据 HTTP 服务（只读）
pub(crate) async fn serve_stats(shared: Arc<Shared>, listener: TcpListener, stop: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("Stats server listening on http://{}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let snapshot_source = shared.clone();
                let spawned = shared.group.go("stats", async move {
                    let handled = tokio::time::timeout(
                        REQUEST_TIMEOUT,
                        handle_stats_request(stream, addr, &snapshot_source),
                    )
                    .await;
                    if handled.is_err() {
                        debug!("Stats request from {} timed out", addr);
                    }
                });
                if let Err(e) = spawned {
                    debug!("Dropping stats request from {}: {}", addr, e);
                }
            }
            Err(e) => {
                warn!("Stats listener accept failed: {}", e);
                break;
            }
        }
    }

    debug!("Stats server stopped");
}

/// 处理单个统计请求
async fn handle_stats_request(mut stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            debug!("Failed to read from stats client {}: {}", addr, e);
            return;
        }
    };

    // 解析HTTP请求行
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = route(path, &shared.snapshot(RECENT_EVENTS));

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to write response to {}: {}", addr, e);
    }
    let _ = stream.shutdown().await;
}

/// 根据路径生成完整的 HTTP 响应
fn route(path: &str, snapshot: &StatsSnapshot) -> String {
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/stats" | "/stats/" => {
            let json = serde_json::to_string_pretty(snapshot).unwrap_or_default();
            http_response("200 OK", "application/json", &json)
        }
        "/" => http_response("200 OK", "text/plain; charset=utf-8", &render_text(snapshot)),
        _ => http_response("404 Not Found", "text/plain", "404 Not Found"),
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// 纯文本摘要
fn render_text(snapshot: &StatsSnapshot) -> String {
    let c = &snapshot.counters;
    let mut out = String::new();

    let _ = writeln!(out, "tls-mux peer '{}'", snapshot.peer_name);
    let _ = writeln!(out, "uptime:      {}", format_duration(snapshot.uptime_secs));
    let _ = writeln!(
        out,
        "listener:    {} accepted, {} served, {} authorized, {} half-open",
        c.accepted, c.served, c.authorized, c.half_open
    );
    let _ = writeln!(
        out,
        "tunnel:      {} requests, {} succeeded, {} sessions",
        c.request, c.success, c.sessions
    );
    let _ = writeln!(
        out,
        "traffic:     {} read, {} written",
        format_bytes(c.bytes_read),
        format_bytes(c.bytes_written)
    );
    let _ = writeln!(
        out,
        "forwards:    {} active, {} tasks",
        snapshot.forwards, snapshot.tasks
    );

    let _ = writeln!(out, "\nTunnels:");
    if snapshot.tunnels.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for t in &snapshot.tunnels {
        let _ = writeln!(
            out,
            "  {:<20} sessions={} streams={} redial={} changed={}",
            t.peer_name, t.sessions, t.streams, t.redial_count, t.last_changed
        );
    }

    let _ = writeln!(out, "\nRecent events:");
    for e in &snapshot.events {
        if e.count > 1 {
            let _ = writeln!(out, "  [{}] {} (x{})", e.timestamp, e.message, e.count);
        } else {
            let _ = writeln!(out, "  [{}] {}", e.timestamp, e.message);
        }
    }
    out
}

/// 格式化字节数为人类可读格式
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// 格式化持续时间为人类可读格式
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{CounterSnapshot, TunnelStats};

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            peer_name: "alice".to_string(),
            started: 100,
            uptime_secs: 3725,
            counters: CounterSnapshot {
                accepted: 10,
                served: 9,
                authorized: 8,
                ..CounterSnapshot::default()
            },
            forwards: 2,
            tasks: 7,
            tunnels: vec![TunnelStats {
                peer_name: "bob".to_string(),
                sessions: 1,
                streams: 2,
                redial_count: 0,
                last_changed: 150,
            }],
            events: Vec::new(),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m");
        assert_eq!(format_duration(90000), "1d 1h");
    }

    #[test]
    fn test_route_json() {
        let response = route("/stats", &snapshot());
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("application/json"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["peer_name"], "alice");
        assert_eq!(json["counters"]["authorized"], 8);
    }

    #[test]
    fn test_route_text_and_404() {
        let text = route("/?refresh=1", &snapshot());
        assert!(text.contains("tls-mux peer 'alice'"));
        assert!(text.contains("bob"));

        let missing = route("/admin", &snapshot());
        assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
    }
}
