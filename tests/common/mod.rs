//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;
use tls_mux::config::{Config, PeerConfig, TlsConfig};
use tls_mux::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing, returns its address
pub async fn start_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Self-signed certificate used as its own CA, removed on drop
pub struct TestCerts {
    dir: PathBuf,
    pub tls: TlsConfig,
}

impl TestCerts {
    pub fn generate(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "tls-mux-it-{}-{}-{}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir).expect("Failed to create cert dir");

        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("Failed to generate test certificate");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).expect("Failed to write cert");
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).expect("Failed to write key");

        Self {
            tls: TlsConfig {
                cert_path: cert_path.clone(),
                key_path,
                ca_path: cert_path,
                server_name: Some("localhost".to_string()),
            },
            dir,
        }
    }
}

impl Drop for TestCerts {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// A peer offering `services` on a mux listener
pub fn service_peer(name: &str, listen: &str, services: &[(&str, SocketAddr)]) -> Config {
    let mut config = Config::new(name);
    config.listen = Some(listen.to_string());
    for (service, addr) in services {
        config
            .services
            .insert(service.to_string(), addr.to_string());
    }
    config
}

/// A peer that dials `remote` and exposes it on a local forward listener
pub fn dialing_peer(name: &str, remote: &str, dial: SocketAddr, service: &str) -> Config {
    let mut config = Config::new(name);
    config.peers.insert(
        remote.to_string(),
        PeerConfig {
            dial: Some(dial.to_string()),
            listen: Some("127.0.0.1:0".to_string()),
            service: service.to_string(),
            redial: true,
        },
    );
    config
}

pub async fn start_server(config: Config) -> Server {
    let server = Server::new(config).expect("Failed to create server");
    server.start().await.expect("Failed to start server");
    server
}

/// Poll `check` until it holds or the deadline passes
pub async fn wait_until<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let result = timeout(deadline, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    result.is_ok()
}

/// Send `data` through `addr` and read back the same number of bytes
pub async fn round_trip(addr: SocketAddr, data: &[u8]) -> Result<Vec<u8>, String> {
    timeout(Duration::from_secs(10), async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect: {}", e))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = vec![0u8; data.len()];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// TCP relay in front of `target` whose live connections can be severed
pub struct Relay {
    pub addr: SocketAddr,
    connections: std::sync::Arc<parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    accept: tokio::task::JoinHandle<()>,
}

impl Relay {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind relay");
        let addr = listener.local_addr().expect("Failed to get relay addr");
        let connections = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let tracked = connections.clone();
        let accept = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let handle = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().push(handle);
            }
        });

        Self {
            addr,
            connections,
            accept,
        }
    }

    /// Drop both sockets of every relayed connection; new connections still work
    pub fn cut(&self) {
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept.abort();
        self.cut();
    }
}
