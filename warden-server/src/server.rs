//! Listeners, accept loops and per-connection handshakes

use crate::defaults::{ACME_RENEWAL_INTERVAL, CLIENT_HELLO_TIMEOUT};
use crate::fingerprint::{self, FingerprintListener, FingerprintedStream};
use crate::http::{AppHandler, ChallengeForwarder, ConnectionInfo, serve_connection};
use crate::tls::{self, CertificateSource, renewal_task};
use rustls::server::Acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;

pub struct Server {
    tls: FingerprintListener,
    http: Option<TcpListener>,
    source: Arc<CertificateSource>,
    app: Arc<dyn AppHandler>,
    renewal_interval: Duration,
}

impl Server {
    pub fn new(
        tls: FingerprintListener,
        http: Option<TcpListener>,
        source: Arc<CertificateSource>,
        app: Arc<dyn AppHandler>,
    ) -> Self {
        Self {
            tls,
            http,
            source,
            app,
            renewal_interval: ACME_RENEWAL_INTERVAL,
        }
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn tls_addr(&self) -> std::io::Result<SocketAddr> {
        self.tls.local_addr()
    }

    pub fn http_addr(&self) -> Option<std::io::Result<SocketAddr>> {
        self.http.as_ref().map(TcpListener::local_addr)
    }

    /// Accept connections until `shutdown` becomes true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Some(manager) = self.source.acme_manager() {
            tokio::spawn(renewal_task(
                manager.clone(),
                self.renewal_interval,
                shutdown.clone(),
            ));
        }

        let plaintext = match (self.http, self.source.challenge_handler()) {
            (Some(listener), Some(challenges)) => {
                let handler: Arc<dyn AppHandler> =
                    Arc::new(ChallengeForwarder::new(challenges, self.app.clone()));
                Some(tokio::spawn(accept_plaintext(
                    listener,
                    handler,
                    shutdown.clone(),
                )))
            }
            (Some(listener), None) => {
                Some(tokio::spawn(accept_plaintext(
                    listener,
                    self.app.clone(),
                    shutdown.clone(),
                )))
            }
            (None, _) => None,
        };

        loop {
            tokio::select! {
                accepted = self.tls.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let source = self.source.clone();
                            let app = self.app.clone();
                            tokio::spawn(async move {
                                serve_tls(stream, peer, source, app).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept TLS connection");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(task) = plaintext {
            task.abort();
        }
        tracing::info!("Server stopped accepting connections");
    }
}

async fn accept_plaintext(
    listener: TcpListener,
    handler: Arc<dyn AppHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(serve_plaintext(stream, peer, handler));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept HTTP connection");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn serve_plaintext(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn AppHandler>) {
    if let Err(e) = serve_connection(stream, ConnectionInfo::plaintext(peer), handler).await {
        tracing::debug!(peer = %peer, error = %e, "HTTP connection ended with error");
    }
}

/// Read the ClientHello, fingerprint it, pick a certificate, then serve HTTP.
async fn serve_tls(
    stream: FingerprintedStream<TcpStream>,
    peer: SocketAddr,
    source: Arc<CertificateSource>,
    app: Arc<dyn AppHandler>,
) {
    let tag = stream.tag();
    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);

    let start = match tokio::time::timeout(CLIENT_HELLO_TIMEOUT, acceptor).await {
        Ok(Ok(start)) => start,
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "Failed to read ClientHello");
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "Timed out waiting for ClientHello");
            return;
        }
    };

    fingerprint::collect(&tag);

    let server_name = start.client_hello().server_name().map(str::to_string);
    let key = match source.resolve(server_name.as_deref()).await {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(
                peer = %peer,
                server_name = server_name.as_deref().unwrap_or("-"),
                error = %e,
                "Refusing TLS handshake"
            );
            return;
        }
    };

    let config = match tls::server_config(key) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to build TLS configuration");
            return;
        }
    };

    let stream = match start.into_stream(config).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let info = ConnectionInfo {
        remote_addr: peer,
        tls: true,
        server_name,
        slot: tag.slot(),
    };
    if let Err(e) = serve_connection(stream, info, app).await {
        tracing::debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
    }
}
