//! HTTP serving on top of accepted connections
//!
//! Every request carries a [`ConnectionInfo`] extension, so application code
//! can read the client fingerprint with [`client_fingerprint`].

use crate::tls::ChallengeHandler;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use warden_core::{FINGERPRINT_NOT_FOUND, FingerprintSlot};

pub type HttpResponse = Response<Full<Bytes>>;

/// Application entry point for requests on either listener.
#[async_trait]
pub trait AppHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse;
}

/// Connection facts attached to each request.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub server_name: Option<String>,
    pub slot: Arc<FingerprintSlot>,
}

impl ConnectionInfo {
    /// Info for a plaintext connection. Its slot is never filled.
    pub fn plaintext(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            tls: false,
            server_name: None,
            slot: Arc::new(FingerprintSlot::new()),
        }
    }

    pub fn fingerprint(&self) -> &str {
        self.slot.get_or_not_found()
    }
}

pub fn connection_info<B>(req: &Request<B>) -> Option<&ConnectionInfo> {
    req.extensions().get::<ConnectionInfo>()
}

/// The client fingerprint for this request, or `"not found"`.
pub fn client_fingerprint<B>(req: &Request<B>) -> &str {
    connection_info(req)
        .map(ConnectionInfo::fingerprint)
        .unwrap_or(FINGERPRINT_NOT_FOUND)
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Replies with the caller's fingerprint. The binary's default application.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintEcho;

#[async_trait]
impl AppHandler for FingerprintEcho {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        text_response(StatusCode::OK, format!("{}\n", client_fingerprint(&req)))
    }
}

/// Plaintext handler: answers ACME challenges, forwards everything else.
pub struct ChallengeForwarder {
    challenges: ChallengeHandler,
    app: Arc<dyn AppHandler>,
}

impl ChallengeForwarder {
    pub fn new(challenges: ChallengeHandler, app: Arc<dyn AppHandler>) -> Self {
        Self { challenges, app }
    }
}

#[async_trait]
impl AppHandler for ChallengeForwarder {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        let path = req.uri().path();
        if !self.challenges.is_challenge_request(path) {
            return self.app.handle(req).await;
        }

        match self.challenges.handle_challenge(path) {
            Some(key_authorization) => {
                tracing::debug!(path = %path, "Answered ACME challenge");
                text_response(StatusCode::OK, key_authorization)
            }
            None => {
                tracing::debug!(path = %path, "Unknown ACME challenge token");
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
        }
    }
}

/// Serve HTTP/1.1 or HTTP/2 on `io` until the client goes away.
pub async fn serve_connection<I>(
    io: I,
    info: ConnectionInfo,
    handler: Arc<dyn AppHandler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(info.clone());
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    ServerBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
}
