use crate::admission::AdmissionCounters;
use crate::eventlog::EventEntry;
use crate::meter::TrafficCounters;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counters
///
/// Updated lock-free on the hot paths and only ever read by observers.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Accepted/admitted totals of the mux listener
    pub admission: Arc<AdmissionCounters>,
    /// Connections that completed the handshake
    pub authorized: AtomicU64,
    /// Outbound stream requests through a tunnel
    pub request: AtomicU64,
    /// Outbound stream requests that got a stream
    pub success: AtomicU64,
    /// Connections accepted but not yet past the handshake
    pub half_open: Arc<AtomicUsize>,
    /// Live authenticated sessions (both directions)
    pub sessions: Arc<AtomicUsize>,
    /// Bytes over every metered transport connection
    pub traffic: Arc<TrafficCounters>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前 (会话数, 半开连接数)，供准入控制读取
    pub fn load(&self) -> (usize, usize) {
        (
            self.sessions.load(Ordering::Relaxed),
            self.half_open.load(Ordering::Relaxed),
        )
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.admission.accepted(),
            served: self.admission.served(),
            authorized: self.authorized.load(Ordering::Relaxed),
            request: self.request.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            half_open: self.half_open.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            bytes_read: self.traffic.bytes_read(),
            bytes_written: self.traffic.bytes_written(),
        }
    }
}

/// RAII 计数：创建时加一，drop 时减一
///
/// 持有计数器的所有权，可以在派生任务之前创建再移入任务
pub struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    pub fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of `ServerStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub served: u64,
    pub authorized: u64,
    pub request: u64,
    pub success: u64,
    pub half_open: usize,
    pub sessions: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Statistics for a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStats {
    /// Peer name
    pub peer_name: String,
    /// Number of live sessions
    pub sessions: usize,
    /// Number of live streams across those sessions
    pub streams: usize,
    /// Consecutive failed dial attempts
    pub redial_count: usize,
    /// Unix timestamp of the last session change
    pub last_changed: u64,
}

/// Everything the metrics endpoint shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub peer_name: String,
    /// Unix timestamp when startup completed (0 before that)
    pub started: u64,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
    /// Live forwarding pairs
    pub forwards: usize,
    /// Running supervised tasks
    pub tasks: usize,
    pub tunnels: Vec<TunnelStats>,
    pub events: Vec<EventEntry>,
}

/// 当前 Unix 时间（秒）
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
