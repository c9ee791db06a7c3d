//! End-to-end TLS tests over loopback
//!
//! Covers:
//! - Disk and dev certificate sources serving a client that trusts the local root
//! - Fingerprints reaching application code through the request extension
//! - The plaintext ACME listener and host policy enforcement during handshakes

mod support;

use std::sync::Arc;
use support::{
    RunningServer, client_config, http_get, https_get, is_fingerprint, require_localhost_bind,
};
use tempfile::TempDir;
use warden_core::DomainSpec;
use warden_server::config::{ServerConfig, SourceConfig};
use warden_server::tls::{self, AcmeRegistry, CertificateSource};

fn server_config(temp: &TempDir, source: SourceConfig) -> ServerConfig {
    ServerConfig {
        source,
        listen: "127.0.0.1:0".parse().unwrap(),
        http_listen: None,
        data_dir: temp.path().join("data"),
        ca_dir: temp.path().join("ca"),
        host_identity: "tester@localhost".to_string(),
        install_trust: false,
    }
}

#[tokio::test]
async fn disk_source_serves_stable_fingerprint() {
    if !require_localhost_bind() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let root = tls::ensure_root_ca(&temp.path().join("ca"), "tester@localhost").unwrap();
    let leaf = tls::issue_leaf(
        &root,
        &["localhost".to_string(), "127.0.0.1".to_string()],
        &temp.path().join("leaf"),
    )
    .unwrap();

    let source = CertificateSource::build(
        &server_config(
            &temp,
            SourceConfig::Disk {
                cert_path: leaf.cert_path,
                key_path: leaf.key_path,
            },
        ),
        &AcmeRegistry::new(),
    )
    .unwrap();
    let server = RunningServer::start(source, false).await;
    let client = client_config(root.cert_pem.as_bytes());

    let first = https_get(server.tls_addr, "localhost", client.clone(), "/")
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    let fingerprint = first.body.trim().to_string();
    assert!(is_fingerprint(&fingerprint), "got {fingerprint:?}");

    let second = https_get(server.tls_addr, "localhost", client, "/")
        .await
        .unwrap();
    assert_eq!(second.body.trim(), fingerprint);

    server.stop().await;
}

#[tokio::test]
async fn dev_source_issues_leaf_for_wildcard_domain() {
    if !require_localhost_bind() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let source = CertificateSource::build(
        &server_config(
            &temp,
            SourceConfig::Dev {
                domain: DomainSpec::parse("*.app.test").unwrap(),
            },
        ),
        &AcmeRegistry::new(),
    )
    .unwrap();
    source.prepare().await.unwrap();

    let root_pem = std::fs::read(temp.path().join("ca").join("rootCA.pem")).unwrap();
    let server = RunningServer::start(source, false).await;
    let client = client_config(&root_pem);

    for name in ["www.app.test", "app.test", "localhost"] {
        let reply = https_get(server.tls_addr, name, client.clone(), "/")
            .await
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(reply.status, 200);
        assert!(is_fingerprint(reply.body.trim()));
    }

    // Not covered by the leaf, so certificate verification fails client side.
    assert!(
        https_get(server.tls_addr, "a.b.app.test", client, "/")
            .await
            .is_err()
    );

    server.stop().await;
}

#[tokio::test]
async fn acme_source_answers_challenges_and_forwards_plaintext() {
    if !require_localhost_bind() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let source = CertificateSource::build(
        &server_config(
            &temp,
            SourceConfig::Acme {
                domain: DomainSpec::parse("*.example.com").unwrap(),
                directory_url: "https://127.0.0.1:9/directory".to_string(),
                email: "ops@example.com".to_string(),
            },
        ),
        &AcmeRegistry::new(),
    )
    .unwrap();
    let server = RunningServer::start(source, true).await;
    let http_addr = server.http_addr.unwrap();

    server
        .source
        .acme_manager()
        .unwrap()
        .challenge_tokens()
        .write()
        .insert("tok123".to_string(), "tok123.thumbprint".to_string());

    let reply = http_get(http_addr, "www.example.com", "/.well-known/acme-challenge/tok123")
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "tok123.thumbprint");

    let missing = http_get(http_addr, "www.example.com", "/.well-known/acme-challenge/nope")
        .await
        .unwrap();
    assert_eq!(missing.status, 404);

    let forwarded = http_get(http_addr, "www.example.com", "/hello").await.unwrap();
    assert_eq!(forwarded.status, 200);
    assert_eq!(forwarded.body.trim(), "not found");

    server.stop().await;
}

#[tokio::test]
async fn acme_source_refuses_unauthorized_server_name() {
    if !require_localhost_bind() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let source = CertificateSource::build(
        &server_config(
            &temp,
            SourceConfig::Acme {
                domain: DomainSpec::parse("example.com").unwrap(),
                directory_url: "https://127.0.0.1:9/directory".to_string(),
                email: "ops@example.com".to_string(),
            },
        ),
        &AcmeRegistry::new(),
    )
    .unwrap();
    let server = RunningServer::start(source, false).await;

    let root = tls::ensure_root_ca(&temp.path().join("ca"), "tester@localhost").unwrap();
    let client = client_config(root.cert_pem.as_bytes());

    assert!(
        https_get(server.tls_addr, "one.example.com", client.clone(), "/")
            .await
            .is_err()
    );
    assert!(
        https_get(server.tls_addr, "example.org", client, "/")
            .await
            .is_err()
    );

    server.stop().await;
}

#[tokio::test]
async fn non_tls_bytes_do_not_stop_the_listener() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    if !require_localhost_bind() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let root = tls::ensure_root_ca(&temp.path().join("ca"), "tester@localhost").unwrap();
    let leaf = tls::issue_leaf(&root, &["localhost".to_string()], &temp.path().join("leaf"))
        .unwrap();
    let source = CertificateSource::Disk(Arc::new(
        tls::load_certified_key(&leaf.cert_path, &leaf.key_path).unwrap(),
    ));
    let server = RunningServer::start(source, false).await;

    let mut raw = tokio::net::TcpStream::connect(server.tls_addr).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let _ = raw.read_to_end(&mut buf).await;

    let reply = https_get(
        server.tls_addr,
        "localhost",
        client_config(root.cert_pem.as_bytes()),
        "/",
    )
    .await
    .unwrap();
    assert!(is_fingerprint(reply.body.trim()));

    server.stop().await;
}
