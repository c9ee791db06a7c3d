//! Minimal TLS ClientHello parser
//!
//! Extracts the fields used for fingerprinting from the raw bytes a client
//! sends before the server has answered: offered versions, cipher suites,
//! supported groups and EC point formats. Handshake messages fragmented over
//! several records are reassembled.

use thiserror::Error;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientHelloError {
    #[error("ClientHello is truncated")]
    Truncated,

    #[error("Not a TLS handshake record (content type {0})")]
    NotHandshake(u8),

    #[error("Not a ClientHello message (handshake type {0})")]
    NotClientHello(u8),

    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),
}

/// Handshake metadata offered by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloSummary {
    /// From the `supported_versions` extension, or the legacy version field.
    pub versions: Vec<u16>,
    pub cipher_suites: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl ClientHelloSummary {
    /// Parse the summary out of the raw bytes read from the socket.
    pub fn parse(raw: &[u8]) -> Result<Self, ClientHelloError> {
        let message = reassemble_handshake(raw)?;
        parse_client_hello(&message)
    }
}

/// Concatenate handshake record payloads until one full handshake message is
/// available, then return that message body.
fn reassemble_handshake(raw: &[u8]) -> Result<Vec<u8>, ClientHelloError> {
    let mut payload = Vec::new();
    let mut rest = raw;

    loop {
        if rest.len() < RECORD_HEADER_LEN {
            return Err(ClientHelloError::Truncated);
        }
        if rest[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(ClientHelloError::NotHandshake(rest[0]));
        }
        let len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        let body = rest
            .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len)
            .ok_or(ClientHelloError::Truncated)?;
        payload.extend_from_slice(body);
        rest = &rest[RECORD_HEADER_LEN + len..];

        if payload.len() >= HANDSHAKE_HEADER_LEN {
            if payload[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(ClientHelloError::NotClientHello(payload[0]));
            }
            let msg_len = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]) as usize;
            if payload.len() >= HANDSHAKE_HEADER_LEN + msg_len {
                payload.truncate(HANDSHAKE_HEADER_LEN + msg_len);
                payload.drain(..HANDSHAKE_HEADER_LEN);
                return Ok(payload);
            }
        }
    }
}

fn parse_client_hello(body: &[u8]) -> Result<ClientHelloSummary, ClientHelloError> {
    let mut r = Reader::new(body);

    let legacy_version = r.u16()?;
    r.skip(32)?; // random
    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let suites_len = r.u16()? as usize;
    if suites_len % 2 != 0 {
        return Err(ClientHelloError::Malformed("odd cipher suite length"));
    }
    let cipher_suites = Reader::new(r.take(suites_len)?).u16_list()?;

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let mut summary = ClientHelloSummary {
        versions: Vec::new(),
        cipher_suites,
        curves: Vec::new(),
        point_formats: Vec::new(),
    };

    // Extensions are optional in very old clients.
    if !r.is_empty() {
        let ext_len = r.u16()? as usize;
        let mut exts = Reader::new(r.take(ext_len)?);
        while !exts.is_empty() {
            let ext_type = exts.u16()?;
            let len = exts.u16()? as usize;
            let mut data = Reader::new(exts.take(len)?);
            match ext_type {
                EXT_SUPPORTED_VERSIONS => {
                    let n = data.u8()? as usize;
                    summary.versions = Reader::new(data.take(n)?).u16_list()?;
                }
                EXT_SUPPORTED_GROUPS => {
                    let n = data.u16()? as usize;
                    summary.curves = Reader::new(data.take(n)?).u16_list()?;
                }
                EXT_EC_POINT_FORMATS => {
                    let n = data.u8()? as usize;
                    summary.point_formats = data.take(n)?.to_vec();
                }
                _ => {}
            }
        }
    }

    if summary.versions.is_empty() {
        summary.versions.push(legacy_version);
    }

    Ok(summary)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClientHelloError> {
        if self.buf.len() < n {
            return Err(ClientHelloError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), ClientHelloError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ClientHelloError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClientHelloError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u16_list(mut self) -> Result<Vec<u16>, ClientHelloError> {
        let mut out = Vec::with_capacity(self.buf.len() / 2);
        while !self.is_empty() {
            out.push(self.u16()?);
        }
        Ok(out)
    }
}

/// Build a ClientHello record from parts. Used by tests across the workspace.
#[doc(hidden)]
pub fn encode_client_hello(
    legacy_version: u16,
    cipher_suites: &[u16],
    extensions: &[(u16, Vec<u8>)],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&legacy_version.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // empty session id
    body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
    for suite in cipher_suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.extend_from_slice(&[1, 0]); // null compression

    let mut ext_bytes = Vec::new();
    for (ext_type, data) in extensions {
        ext_bytes.extend_from_slice(&ext_type.to_be_bytes());
        ext_bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
        ext_bytes.extend_from_slice(data);
    }
    if !extensions.is_empty() {
        body.extend_from_slice(&(ext_bytes.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext_bytes);
    }

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
