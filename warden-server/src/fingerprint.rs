//! Handshake fingerprint collection
//!
//! [`FingerprintListener`] tags every accepted connection with a
//! [`ConnectionTag`]: a fresh fingerprint slot plus a copy of the bytes read
//! until the ClientHello has been consumed. Once the TLS layer has the hello,
//! [`collect`] parses the captured bytes and fills the slot, before any
//! certificate is chosen.

use crate::defaults::CLIENT_HELLO_CAPTURE_LIMIT;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use warden_core::{ClientHelloSummary, FingerprintSlot};

/// Per-connection fingerprint state.
#[derive(Debug)]
pub struct ConnectionTag {
    slot: Arc<FingerprintSlot>,
    /// `None` once capture has stopped.
    capture: Mutex<Option<Vec<u8>>>,
    capturing: AtomicBool,
    limit: usize,
}

impl ConnectionTag {
    pub fn new(limit: usize) -> Self {
        Self {
            slot: Arc::new(FingerprintSlot::new()),
            capture: Mutex::new(Some(Vec::new())),
            capturing: AtomicBool::new(true),
            limit,
        }
    }

    pub fn slot(&self) -> Arc<FingerprintSlot> {
        self.slot.clone()
    }

    fn observe(&self, bytes: &[u8]) {
        if !self.capturing.load(Ordering::Acquire) {
            return;
        }
        let mut capture = self.capture.lock();
        if let Some(buf) = capture.as_mut() {
            let room = self.limit.saturating_sub(buf.len());
            buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    }

    /// Stop capturing and hand back what was read so far.
    pub fn take_capture(&self) -> Vec<u8> {
        let mut capture = self.capture.lock();
        self.capturing.store(false, Ordering::Release);
        capture.take().unwrap_or_default()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }
}

/// Store the fingerprint of `hello` in the tagged connection's slot.
///
/// Untagged connections are ignored. Returns the digest when it was stored.
pub fn record(tag: Option<&ConnectionTag>, hello: &ClientHelloSummary) -> Option<String> {
    let tag = tag?;
    let digest = hello.fingerprint();
    tag.slot.set(digest.clone()).then_some(digest)
}

/// Parse the captured ClientHello and record its fingerprint.
///
/// A hello that cannot be parsed leaves the slot empty.
pub fn collect(tag: &ConnectionTag) -> Option<String> {
    let raw = tag.take_capture();
    match ClientHelloSummary::parse(&raw) {
        Ok(hello) => record(Some(tag), &hello),
        Err(e) => {
            tracing::debug!(error = %e, captured = raw.len(), "Could not fingerprint ClientHello");
            None
        }
    }
}

/// Stream wrapper that tees reads into its [`ConnectionTag`].
pub struct FingerprintedStream<S> {
    inner: S,
    tag: Arc<ConnectionTag>,
}

impl<S> FingerprintedStream<S> {
    pub fn new(inner: S, tag: Arc<ConnectionTag>) -> Self {
        Self { inner, tag }
    }

    pub fn tag(&self) -> Arc<ConnectionTag> {
        self.tag.clone()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FingerprintedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll
            && buf.filled().len() > before
        {
            self.tag.observe(&buf.filled()[before..]);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FingerprintedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// TCP listener whose connections carry a [`ConnectionTag`].
pub struct FingerprintListener {
    inner: TcpListener,
    capture_limit: usize,
}

impl FingerprintListener {
    pub fn new(inner: TcpListener) -> Self {
        Self {
            inner,
            capture_limit: CLIENT_HELLO_CAPTURE_LIMIT,
        }
    }

    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(FingerprintedStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let tag = Arc::new(ConnectionTag::new(self.capture_limit));
        Ok((FingerprintedStream::new(stream, tag), peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use warden_core::{FINGERPRINT_NOT_FOUND, encode_client_hello};

    fn sample_hello() -> Vec<u8> {
        encode_client_hello(
            0x0303,
            &[0x0a0a, 0x1301, 0x1302, 0xc02b],
            &[
                (0x002b, vec![4, 0x7a, 0x7a, 0x03, 0x04]),
                (0x000a, vec![0, 4, 0x00, 0x1d, 0x00, 0x17]),
                (0x000b, vec![1, 0]),
            ],
        )
    }

    fn summary(raw: &[u8]) -> ClientHelloSummary {
        ClientHelloSummary::parse(raw).unwrap()
    }

    #[test]
    fn record_without_tag_is_noop() {
        assert!(record(None, &summary(&sample_hello())).is_none());
    }

    #[test]
    fn record_sets_slot_once() {
        let tag = ConnectionTag::new(1024);
        let hello = summary(&sample_hello());

        let digest = record(Some(&tag), &hello).unwrap();
        assert_eq!(digest.len(), 16);
        assert_eq!(tag.slot().get(), Some(digest.as_str()));
        assert!(record(Some(&tag), &hello).is_none());
    }

    #[test]
    fn collect_stops_capture() {
        let tag = ConnectionTag::new(1024);
        tag.observe(&sample_hello());
        let digest = collect(&tag).unwrap();

        assert!(!tag.is_capturing());
        tag.observe(b"late bytes");
        assert!(tag.take_capture().is_empty());
        assert_eq!(tag.slot().get_or_not_found(), digest);
    }

    #[test]
    fn reads_after_capture_skip_the_lock() {
        let tag = Arc::new(ConnectionTag::new(1024));
        tag.take_capture();
        let _held = tag.capture.lock();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let reader = tag.clone();
        std::thread::spawn(move || {
            reader.observe(b"application data");
            let _ = done_tx.send(());
        });
        assert!(
            done_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .is_ok()
        );
    }

    #[test]
    fn garbage_leaves_slot_empty() {
        let tag = ConnectionTag::new(1024);
        tag.observe(b"GET / HTTP/1.1\r\n\r\n");
        assert!(collect(&tag).is_none());
        assert_eq!(tag.slot().get_or_not_found(), FINGERPRINT_NOT_FOUND);
    }

    #[test]
    fn capture_is_capped() {
        let tag = ConnectionTag::new(8);
        tag.observe(&[1; 5]);
        tag.observe(&[2; 5]);
        assert_eq!(tag.take_capture(), vec![1, 1, 1, 1, 1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn listener_tees_reads_and_passes_writes() {
        let listener = FingerprintListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&sample_hello()).await.unwrap();
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut stream, _peer) = listener.accept().await.unwrap();
        let expected = sample_hello();
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"ok").await.unwrap();

        assert_eq!(client.await.unwrap(), *b"ok");
        let tag = stream.tag();
        assert_eq!(tag.take_capture(), expected);
    }
}
