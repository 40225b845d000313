use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;

/// 双向 TLS 上下文
///
/// 同一份证书既作为服务端证书出示给拨入方，也作为客户端证书出示给被拨方；
/// 双方都只信任 `ca_path` 签发的证书。
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsContext {
    /// 从配置加载证书、私钥与 CA，构建双向 TLS 上下文
    pub fn load(config: &TlsConfig) -> Result<Arc<Self>> {
        let certs = load_certs(&config.cert_path)?;
        let key = load_private_key(&config.key_path)?;
        let roots = Arc::new(load_root_store(&config.ca_path)?);

        // 服务端：强制要求客户端证书
        let verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .context("Failed to build client certificate verifier")?;
        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .context("Failed to create server config")?;

        // 客户端：出示本端证书
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("Failed to create client config")?;

        Ok(Arc::new(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        }))
    }

    /// 计算拨号时使用的 SNI / 证书校验名称
    ///
    /// 优先使用配置的 `server_name`，否则取拨号地址的主机部分
    pub fn server_name_for(&self, dial_addr: &str) -> Result<ServerName<'static>> {
        let host = match self.server_name {
            Some(ref name) => name.clone(),
            None => host_of(dial_addr).to_string(),
        };
        ServerName::try_from(host.clone())
            .with_context(|| format!("Invalid TLS server name: {}", host))
    }
}

/// 取 "host:port" 的主机部分，兼容 "[::1]:port" 形式
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}

fn load_root_store(path: &Path) -> Result<rustls::RootCertStore> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CA cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.context("Failed to parse CA certificates")?;
        root_store
            .add(cert)
            .context("Failed to add CA certificate")?;
    }
    if root_store.is_empty() {
        anyhow::bail!("No CA certificate found in {:?}", path);
    }
    Ok(root_store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct TestCerts {
        dir: PathBuf,
        config: TlsConfig,
    }

    impl Drop for TestCerts {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn write_self_signed(tag: &str) -> TestCerts {
        let dir = std::env::temp_dir().join(format!(
            "tls-mux-tls-{}-{}-{}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let cert = generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();

        TestCerts {
            config: TlsConfig {
                cert_path: cert_path.clone(),
                key_path,
                ca_path: cert_path,
                server_name: None,
            },
            dir,
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_load_missing_files() {
        let config = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
            ca_path: PathBuf::from("/nonexistent/ca.pem"),
            server_name: None,
        };
        assert!(TlsContext::load(&config).is_err());
    }

    #[test]
    fn test_server_name_override() {
        let certs = write_self_signed("sni");
        let mut config = certs.config.clone();
        config.server_name = Some("localhost".to_string());
        let ctx = TlsContext::load(&config).unwrap();

        let name = ctx.server_name_for("10.1.2.3:38000").unwrap();
        assert_eq!(name, ServerName::try_from("localhost").unwrap());
    }

    #[tokio::test]
    async fn test_mutual_tls_handshake() {
        let certs = write_self_signed("mtls");
        let ctx = TlsContext::load(&certs.config).unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = ctx.acceptor.clone();
        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let name = ctx.server_name_for("localhost:38000").unwrap();
        let mut client = ctx.connector.connect(name, client_io).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_without_certificate_rejected() {
        let certs = write_self_signed("nocert");
        let ctx = TlsContext::load(&certs.config).unwrap();

        // 只信任 CA、不出示客户端证书
        let roots = load_root_store(&certs.config.ca_path).unwrap();
        let anonymous = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(anonymous));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = ctx.acceptor.clone();
        let server = tokio::spawn(async move { acceptor.accept(server_io).await.is_ok() });

        let name = ServerName::try_from("localhost").unwrap();
        // TLS 1.3 下客户端握手可能先于服务端拒绝完成，以服务端结果为准
        if let Ok(mut stream) = connector.connect(name, client_io).await {
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        }
        assert!(!server.await.unwrap());
    }
}
