use crate::config::Config;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tls-mux")]
#[command(author, version, about = "Mutual-TLS tunneling multiplexer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，可被 RUST_LOG 覆盖
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行：直到 Ctrl-C / SIGTERM 退出，SIGHUP 重新加载配置
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "tls-mux.toml")]
        config: String,
    },
    /// 检查配置文件是否有效
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}

/// 展开 `~` 并转换为绝对路径
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(path_buf)
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path_buf))
    }
}

/// 检查配置文件权限（仅Unix系统）
///
/// 配置文件中包含私钥路径，组或其他用户可读时给出警告
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = std::fs::metadata(config_path).with_context(|| {
        format!(
            "Failed to read metadata for config file: {}",
            config_path.display()
        )
    })?;
    let mode = metadata.permissions().mode();

    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}), consider chmod 600",
            config_path.display(),
            mode & 0o777
        );
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &std::path::Path) -> Result<()> {
    Ok(())
}

/// 加载配置文件：展开路径、检查权限、解析并验证
pub fn load_config(path: &str) -> Result<Config> {
    let path = expand_path(path)?;
    check_config_file_permissions(&path)?;
    Config::load(&path)
}

/// 打印配置摘要（`check` 子命令）
pub fn render_summary(config: &Config) -> String {
    let mut out = String::new();
    let line = |out: &mut String, s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line(&mut out, format!("✓ Peer name: {}", config.peer_name));
    line(
        &mut out,
        format!(
            "✓ Mux listener: {}",
            config.listen.as_deref().unwrap_or("(disabled)")
        ),
    );
    line(
        &mut out,
        format!(
            "✓ Stats listener: {}",
            config.http_listen.as_deref().unwrap_or("(disabled)")
        ),
    );
    match config.tls {
        Some(ref tls) => {
            line(&mut out, format!("✓ Certificate: {}", tls.cert_path.display()));
            line(&mut out, format!("✓ Key: {}", tls.key_path.display()));
            line(&mut out, format!("✓ CA: {}", tls.ca_path.display()));
        }
        None => line(&mut out, "⚠ Warning: TLS disabled, peers talk in plaintext".into()),
    }

    line(&mut out, format!("✓ Services: {}", config.services.len()));
    for (name, addr) in &config.services {
        line(&mut out, format!("  {} -> {}", name, addr));
    }

    line(&mut out, format!("✓ Peers: {}", config.peers.len()));
    for (name, peer) in &config.peers {
        line(
            &mut out,
            format!(
                "  '{}': dial={} listen={} service={:?} redial={}",
                name,
                peer.dial.as_deref().unwrap_or("-"),
                peer.listen.as_deref().unwrap_or("-"),
                peer.service,
                peer.redial
            ),
        );
    }
    out
}
