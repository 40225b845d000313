use anyhow::{bail, Result};
use tracing::warn;

use super::{AdmissionConfig, Config, LimitsConfig, MuxConfig, PeerConfig, TlsConfig};

/// yamux 要求连接级窗口不小于每个子流的默认窗口乘以子流数
const STREAM_WINDOW: usize = 256 * 1024;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_config(config: &Config) -> Result<()> {
        Self::validate_name(&config.peer_name, "peer_name")?;

        if let Some(ref addr) = config.listen {
            Self::validate_address(addr, "listen")?;
        }
        if let Some(ref addr) = config.http_listen {
            Self::validate_address(addr, "http_listen")?;
        }
        if config.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }

        if let Some(ref tls) = config.tls {
            Self::validate_tls_config(tls)?;
        } else {
            warn!("No [tls] table configured, peers will connect in plaintext");
        }

        Self::validate_admission_config(&config.admission)?;
        Self::validate_mux_config(&config.mux)?;
        Self::validate_limits_config(&config.limits)?;

        for (name, addr) in &config.services {
            Self::validate_name(name, "services")?;
            Self::validate_address(addr, &format!("services.{}", name))?;
        }

        for (name, peer) in &config.peers {
            Self::validate_peer_config(name, peer)?;
        }

        Ok(())
    }

    /// 验证 TLS 材料路径
    pub fn validate_tls_config(config: &TlsConfig) -> Result<()> {
        for (path, key) in [
            (&config.cert_path, "tls.cert_path"),
            (&config.key_path, "tls.key_path"),
            (&config.ca_path, "tls.ca_path"),
        ] {
            if path.as_os_str().is_empty() {
                bail!("{} cannot be empty", key);
            }
        }
        if let Some(ref name) = config.server_name {
            Self::validate_name(name, "tls.server_name")?;
        }
        Ok(())
    }

    /// 验证准入控制参数
    pub fn validate_admission_config(config: &AdmissionConfig) -> Result<()> {
        if config.full == 0 {
            bail!("admission.full must be greater than 0");
        }
        if config.start > config.full {
            bail!(
                "admission.start ({}) cannot be greater than admission.full ({})",
                config.start,
                config.full
            );
        }
        if !(0.0..=1.0).contains(&config.rate) {
            bail!("admission.rate must be within [0, 1] (got {})", config.rate);
        }
        Ok(())
    }

    /// 验证多路复用参数
    pub fn validate_mux_config(config: &MuxConfig) -> Result<()> {
        if config.accept_backlog == 0 {
            bail!("mux.accept_backlog must be greater than 0");
        }
        if config.max_streams == 0 {
            bail!("mux.max_streams must be greater than 0");
        }
        if config.open_timeout_secs == 0 {
            bail!("mux.open_timeout_secs must be greater than 0");
        }
        if config.close_timeout_secs == 0 {
            bail!("mux.close_timeout_secs must be greater than 0");
        }
        if let Some(window) = config.receive_window {
            let min = STREAM_WINDOW.saturating_mul(config.max_streams);
            if window < min {
                bail!(
                    "mux.receive_window ({}) must be at least {} bytes for {} streams",
                    window,
                    min,
                    config.max_streams
                );
            }
        }
        Ok(())
    }

    /// 验证资源上限
    pub fn validate_limits_config(config: &LimitsConfig) -> Result<()> {
        if config.max_forwards == 0 {
            bail!("limits.max_forwards must be greater than 0");
        }
        if config.max_tasks == 0 {
            bail!("limits.max_tasks must be greater than 0");
        }
        // 每个转发对占用两个任务名额
        if config.max_tasks < config.max_forwards.saturating_mul(2) {
            warn!(
                "limits.max_tasks ({}) is less than twice limits.max_forwards ({}), \
                 forwards may be refused before the forward limit is reached",
                config.max_tasks, config.max_forwards
            );
        }
        Ok(())
    }

    /// 验证单个隧道定义
    pub fn validate_peer_config(name: &str, config: &PeerConfig) -> Result<()> {
        Self::validate_name(name, "peers")?;
        let context = format!("peers.{}", name);

        if config.dial.is_none() && config.listen.is_none() {
            bail!("{}: at least one of dial or listen must be set", context);
        }
        if let Some(ref addr) = config.dial {
            Self::validate_address(addr, &format!("{}.dial", context))?;
        }
        if let Some(ref addr) = config.listen {
            Self::validate_address(addr, &format!("{}.listen", context))?;
            if config.service.trim().is_empty() {
                bail!("{}: service must be set when listen is configured", context);
            }
        }
        Ok(())
    }
}
