#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use warden_server::{CertificateSource, FingerprintEcho, FingerprintListener, Server};

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn should_fail_when_localhost_bind_unavailable(ci_env: Option<&str>) -> bool {
    ci_env.is_some_and(|value| !value.trim().is_empty())
}

pub fn require_localhost_bind() -> bool {
    if can_bind_localhost() {
        return true;
    }
    if should_fail_when_localhost_bind_unavailable(std::env::var("CI").ok().as_deref()) {
        panic!("integration test requires localhost bind access in CI environment");
    }
    eprintln!("skipping integration test: localhost bind access unavailable");
    false
}

/// In-process server on ephemeral loopback ports.
pub struct RunningServer {
    pub tls_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub source: Arc<CertificateSource>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub async fn start(source: CertificateSource, with_http: bool) -> Self {
        warden_server::install_rustls_crypto_provider();

        let source = Arc::new(source);
        let tls = FingerprintListener::bind("127.0.0.1:0").await.unwrap();
        let http = if with_http {
            Some(tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap())
        } else {
            None
        };

        let server = Server::new(tls, http, source.clone(), Arc::new(FingerprintEcho));
        let tls_addr = server.tls_addr().unwrap();
        let http_addr = server.http_addr().map(|addr| addr.unwrap());

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));

        Self {
            tls_addr,
            http_addr,
            source,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Client configuration trusting only `root_pem`.
pub fn client_config(root_pem: &[u8]) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &root_pem[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// `GET path` over TLS, presenting `server_name` in SNI.
pub async fn https_get(
    addr: SocketAddr,
    server_name: &str,
    config: Arc<rustls::ClientConfig>,
    path: &str,
) -> std::io::Result<HttpReply> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let tls = TlsConnector::from(config).connect(name, tcp).await?;
    request(tls, server_name, path).await
}

/// `GET path` over plaintext HTTP.
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> std::io::Result<HttpReply> {
    let tcp = TcpStream::connect(addr).await?;
    request(tcp, host, path).await
}

async fn request<S>(mut stream: S, host: &str, path: &str) -> std::io::Result<HttpReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            // Peers may close without close_notify once the response is out.
            Err(e) if !raw.is_empty() && e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    parse_reply(&raw)
}

fn parse_reply(raw: &[u8]) -> std::io::Result<HttpReply> {
    let text = String::from_utf8_lossy(raw);
    let invalid = || std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed HTTP reply");
    let (head, body) = text.split_once("\r\n\r\n").ok_or_else(invalid)?;
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(invalid)?;
    Ok(HttpReply {
        status,
        body: body.to_string(),
    })
}

pub fn is_fingerprint(value: &str) -> bool {
    value.len() == 16 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
