// 配置管理模块 - 不可变快照 + 独立的验证器

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 完整配置快照
///
/// 运行期间整体替换、从不原地修改；处理器在需要时读取当前快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 本端 peer 名称（握手时发送给对端）
    pub peer_name: String,
    /// mux 监听地址（接受其他 peer 的连接），可选
    #[serde(default)]
    pub listen: Option<String>,
    /// 统计信息 HTTP 监听地址，可选
    #[serde(default)]
    pub http_listen: Option<String>,
    /// 握手、拨号等单次操作的超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// TLS 配置；缺省时以明文运行
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// TCP 参数
    #[serde(default)]
    pub tcp: TcpConfig,
    /// 准入控制参数
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// 多路复用参数
    #[serde(default)]
    pub mux: MuxConfig,
    /// 资源上限
    #[serde(default)]
    pub limits: LimitsConfig,
    /// 服务名 -> 拨号地址
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    /// peer 名 -> 隧道定义
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// TLS 材料
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// 本端证书（同时用作服务端证书与客户端证书）
    pub cert_path: PathBuf,
    /// 本端私钥
    pub key_path: PathBuf,
    /// 用于验证对端证书的 CA
    pub ca_path: PathBuf,
    /// 拨号时校验的服务器名称，缺省使用拨号地址的主机部分
    #[serde(default)]
    pub server_name: Option<String>,
}

/// TCP 连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// TCP keepalive 空闲时间（秒）
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive 探测间隔（秒）
    #[serde(default)]
    pub keepalive_interval_secs: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive_secs: Some(60),
            keepalive_interval_secs: Some(15),
        }
    }
}

fn default_true() -> bool {
    true
}

/// 准入控制参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// 软阈值：半开连接数达到后开始按概率拒绝
    #[serde(default = "default_admission_start")]
    pub start: usize,
    /// 硬阈值：半开连接数达到后全部拒绝
    #[serde(default = "default_admission_full")]
    pub full: usize,
    /// 软阈值与硬阈值之间的拒绝概率
    #[serde(default = "default_admission_rate")]
    pub rate: f64,
    /// 已认证会话上限（0 表示不限制）
    #[serde(default)]
    pub max_sessions: usize,
}

fn default_admission_start() -> usize {
    10
}

fn default_admission_full() -> usize {
    60
}

fn default_admission_rate() -> f64 {
    0.3
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            start: default_admission_start(),
            full: default_admission_full(),
            rate: default_admission_rate(),
            max_sessions: 0,
        }
    }
}

/// 多路复用参数，会话创建时冻结
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// 等待被服务的入站子流队列长度
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
    /// 单个会话的最大子流数
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// 连接级接收窗口（字节），缺省使用 yamux 默认值
    #[serde(default)]
    pub receive_window: Option<usize>,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

fn default_accept_backlog() -> usize {
    256
}

fn default_max_streams() -> usize {
    512
}

fn default_open_timeout_secs() -> u64 {
    10
}

fn default_close_timeout_secs() -> u64 {
    5
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            accept_backlog: default_accept_backlog(),
            max_streams: default_max_streams(),
            receive_window: None,
            open_timeout_secs: default_open_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl MuxConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

/// 资源上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 同时进行的转发对上限
    #[serde(default = "default_max_forwards")]
    pub max_forwards: usize,
    /// 任务组并发上限
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

fn default_max_forwards() -> usize {
    4096
}

fn default_max_tasks() -> usize {
    16384
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_forwards: default_max_forwards(),
            max_tasks: default_max_tasks(),
        }
    }
}

/// 隧道定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// 对端 mux 地址；缺省时只等待对端拨入
    #[serde(default)]
    pub dial: Option<String>,
    /// 本地转发监听地址：接受的连接经隧道送往对端
    #[serde(default)]
    pub listen: Option<String>,
    /// 请求对端转发到的服务名
    #[serde(default)]
    pub service: String,
    /// 断线后是否自动重连
    #[serde(default = "default_true")]
    pub redial: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            dial: None,
            listen: None,
            service: String::new(),
            redial: true,
        }
    }
}

impl Config {
    /// 创建只包含 peer 名称的最小配置
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            listen: None,
            http_listen: None,
            request_timeout_secs: default_request_timeout_secs(),
            tls: None,
            tcp: TcpConfig::default(),
            admission: AdmissionConfig::default(),
            mux: MuxConfig::default(),
            limits: LimitsConfig::default(),
            services: BTreeMap::new(),
            peers: BTreeMap::new(),
        }
    }

    /// 从 TOML 文件加载并验证
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// 从 TOML 文本解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_config(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 解析服务名对应的拨号地址（空服务名视为未设置）
    pub fn service_addr(&self, service: &str) -> Option<&str> {
        if service.is_empty() {
            return None;
        }
        self.services.get(service).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        peer_name = "alice"
        listen = "0.0.0.0:38000"
        http_listen = "127.0.0.1:38080"
        request_timeout_secs = 15

        [tls]
        cert_path = "/etc/tls-mux/alice.pem"
        key_path = "/etc/tls-mux/alice.key"
        ca_path = "/etc/tls-mux/ca.pem"

        [admission]
        start = 5
        full = 20
        rate = 0.5

        [services]
        echo = "127.0.0.1:7"

        [peers.bob]
        dial = "bob.example.com:38000"
        listen = "127.0.0.1:10007"
        service = "echo"
    "#;

    #[test]
    fn test_toml_deserialization() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.peer_name, "alice");
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.admission.start, 5);
        assert_eq!(config.admission.full, 20);
        assert_eq!(config.admission.max_sessions, 0);
        assert_eq!(config.service_addr("echo"), Some("127.0.0.1:7"));

        let bob = &config.peers["bob"];
        assert_eq!(bob.dial.as_deref(), Some("bob.example.com:38000"));
        assert!(bob.redial);
        assert!(config.tls.is_some());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml(r#"peer_name = "solo""#).unwrap();
        assert!(config.tls.is_none());
        assert!(config.tcp.nodelay);
        assert_eq!(config.mux.accept_backlog, 256);
        assert_eq!(config.mux.max_streams, 512);
        assert_eq!(config.limits.max_forwards, 4096);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_service_addr_empty_name() {
        let mut config = Config::new("x");
        config.services.insert(String::new(), "127.0.0.1:1".to_string());
        assert_eq!(config.service_addr(""), None);
        assert_eq!(config.service_addr("missing"), None);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Config::from_toml("peer_name = ").is_err());
        assert!(Config::from_toml(r#"listen = "0.0.0.0:1""#).is_err());
    }
}
