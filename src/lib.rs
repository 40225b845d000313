/// TLS Mux 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod admission;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod eventlog;
pub mod forwarder;
pub mod group;
pub mod meter;
pub mod mux;
pub mod net;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use admission::{Admission, AdmissionListener, AdmissionPolicy};
pub use config::Config;
pub use error::{Result, TunnelError};
pub use forwarder::Forwarder;
pub use group::TaskGroup;
pub use mux::{MuxStream, Session};
pub use server::Server;
pub use stats::StatsSnapshot;
pub use tunnel::{Handler, Tunnel};
