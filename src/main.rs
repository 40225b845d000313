use anyhow::Result;
use clap::Parser;
use tls_mux::cli::{self, Cli, Commands};
use tls_mux::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先，否则使用命令行指定的级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("TLS Mux v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check(config),
    }
}

async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = cli::load_config(config_path)?;

    let server = Server::new(config)?;
    if let Err(e) = server.start().await {
        server.shutdown().await;
        return Err(e);
    }

    wait_for_signals(&server, config_path).await;
    server.shutdown().await;
    Ok(())
}

/// 等待退出信号；SIGHUP 触发重新加载，失败时保留当前配置
#[cfg(unix)]
async fn wait_for_signals(server: &Server, config_path: &str) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            error!("Failed to install signal handlers, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                return;
            }
            _ = term.recv() => {
                info!("Received SIGTERM");
                return;
            }
            _ = hup.recv() => {
                info!("Received SIGHUP, reloading {}", config_path);
                let reloaded = cli::load_config(config_path)
                    .and_then(|config| server.load_config(config));
                if let Err(e) = reloaded {
                    error!("Reload failed, keeping current configuration: {:#}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_server: &Server, _config_path: &str) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C");
}

fn check(config_path: &str) -> Result<()> {
    let path = cli::expand_path(config_path)?;
    println!("Checking configuration file: {}\n", path.display());

    match cli::load_config(config_path) {
        Ok(config) => {
            print!("{}", cli::render_summary(&config));
            println!("\n✓ Configuration is valid!");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{:#}", e);
            Err(e)
        }
    }
}
