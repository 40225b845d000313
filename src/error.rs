/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用方可以据此区分
/// "需要退避重试的拨号失败" 与 "正常的无事可做"。
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道核心的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 握手协议错误（类型标签不匹配、消息格式错误等）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 握手消息超过 16 位长度字段可表示的范围
    #[error("Handshake message too long: {len} bytes (limit: 65535 bytes)")]
    MessageTooLong { len: usize },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 操作被取消（通常是关闭流程触发）
    #[error("Operation canceled")]
    Canceled,

    /// 已有拨号在进行中（不是故障）
    #[error("Dial already in progress")]
    DialInProgress,

    /// 未配置拨号地址（不是故障）
    #[error("No dial address configured")]
    NoDialAddress,

    /// 并发转发数达到上限
    #[error("Forward limit reached ({limit} concurrent pairings)")]
    ForwardLimit { limit: usize },

    /// 任务组已满
    #[error("Task group is full")]
    GroupFull,

    /// 正在关闭
    #[error("Shutting down")]
    ShuttingDown,

    /// 多路复用会话已关闭
    #[error("Mux session closed")]
    SessionClosed,

    /// 多路复用层错误
    #[error("Mux error: {0}")]
    Mux(String),

    /// TLS 错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 拨号的两种"非错误"结果：不计入退避，也不按警告记录
    pub fn is_benign_dial(&self) -> bool {
        matches!(self, Self::DialInProgress | Self::NoDialAddress)
    }

    /// 是否由关闭流程引起
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Canceled)
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

impl From<yamux::ConnectionError> for TunnelError {
    fn from(e: yamux::ConnectionError) -> Self {
        Self::Mux(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error() {
        let err = TunnelError::timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_benign_dial_errors() {
        assert!(TunnelError::DialInProgress.is_benign_dial());
        assert!(TunnelError::NoDialAddress.is_benign_dial());
        assert!(!TunnelError::timeout(Duration::from_secs(1)).is_benign_dial());
        assert!(!TunnelError::protocol("bad tag").is_benign_dial());
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = TunnelError::config_error("test");
        let shutdown_err = TunnelError::ShuttingDown;

        assert!(config_err.is_config_error());
        assert!(!config_err.is_shutdown());
        assert!(shutdown_err.is_shutdown());
        assert!(TunnelError::Canceled.is_shutdown());
    }

    #[test]
    fn test_message_too_long_display() {
        let err = TunnelError::MessageTooLong { len: 65536 };
        assert_eq!(
            err.to_string(),
            "Handshake message too long: 65536 bytes (limit: 65535 bytes)"
        );
    }
}
