//! Postgres startup-phase wire codec.
//!
//! Only the first frame of a connection is ever interpreted: either an
//! `SSLRequest` or a startup message carrying the protocol version and a
//! list of NUL-terminated key/value parameters. Everything after the
//! startup phase is opaque to the proxy.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic code sent in place of a protocol version to request TLS.
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Byte written back to the client to accept an `SSLRequest`.
pub const SSL_ACCEPT: u8 = b'S';

/// Upper bound on a startup frame, including the length word itself.
/// Anything larger is rejected before the payload is allocated.
pub const MAX_STARTUP_FRAME_LENGTH: usize = 64 * 1024;

/// SQLSTATE class 08: connection exception.
pub const SQLSTATE_CONNECTION_FAILURE: ErrorCode = *b"08006";

pub type ErrorCode = [u8; 5];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error while reading startup frame: {0}")]
    Io(#[from] io::Error),

    #[error("invalid startup frame length {0}")]
    InvalidFrame(u32),

    #[error("startup frame of {0} bytes exceeds the {MAX_STARTUP_FRAME_LENGTH} byte limit")]
    FrameTooLarge(u32),

    #[error("malformed startup message: {0}")]
    MalformedStartup(&'static str),
}

/// First frame sent by a postgres client.
#[derive(Debug)]
pub enum FeStartupMessage {
    /// The client asks to switch to TLS before sending its real startup
    /// message.
    SslRequest,
    Startup(StartupMessage),
}

/// A decoded startup message, plus the exact bytes it arrived as.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    /// Protocol version, opaque to the proxy and preserved for re-emission.
    pub version: u32,
    pub params: StartupParams,
    raw: Bytes,
}

impl StartupMessage {
    /// The frame exactly as received on the wire, length header included.
    pub fn raw_frame(&self) -> Bytes {
        self.raw.clone()
    }
}

/// Startup parameters in the order the client sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams(Vec<(String, String)>);

impl StartupParams {
    /// Get a parameter's value by its name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter().find_map(|(k, v)| (k == name).then_some(v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the portion of the payload after the protocol version.
    ///
    /// Parsing stops at the first empty key or when the input runs out; a
    /// key without a terminated value is an error.
    fn parse(mut body: &[u8]) -> Result<Self, CodecError> {
        let mut pairs = Vec::new();
        loop {
            let Some(key) = take_cstr(&mut body)? else {
                break;
            };
            if key.is_empty() {
                break;
            }
            let Some(value) = take_cstr(&mut body)? else {
                return Err(CodecError::MalformedStartup("parameter value is missing"));
            };
            pairs.push((key, value));
        }
        Ok(Self(pairs))
    }
}

impl FromIterator<(String, String)> for StartupParams {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Take one NUL-terminated string off the front of `body`.
/// Returns `None` when no terminator is left, which also swallows a
/// trailing unterminated fragment the way the protocol expects.
fn take_cstr(body: &mut &[u8]) -> Result<Option<String>, CodecError> {
    let Some(end) = body.iter().position(|&b| b == 0) else {
        return Ok(None);
    };
    let (head, rest) = body.split_at(end);
    let s = std::str::from_utf8(head)
        .map_err(|_| CodecError::MalformedStartup("parameters are not valid utf-8"))?;
    *body = &rest[1..];
    Ok(Some(s.to_owned()))
}

/// Read one startup-phase frame off the stream.
///
/// Anything whose payload leads with [`SSL_REQUEST_CODE`] is classified as
/// an `SSLRequest`, not just the canonical 8-byte frame. libpq never sends
/// a longer variant, but lenient peers exist and the cheap check keeps us
/// compatible with them.
pub async fn read_startup<S>(stream: &mut S) -> Result<FeStartupMessage, CodecError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header);
    if len < 4 {
        return Err(CodecError::InvalidFrame(len));
    }
    if len as usize > MAX_STARTUP_FRAME_LENGTH {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize - 4];
    stream.read_exact(&mut payload).await?;

    if payload.len() >= 4 && payload[..4] == SSL_REQUEST_CODE.to_be_bytes() {
        return Ok(FeStartupMessage::SslRequest);
    }
    if payload.len() < 4 {
        return Err(CodecError::InvalidFrame(len));
    }

    let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let params = StartupParams::parse(&payload[4..])?;

    let mut raw = BytesMut::with_capacity(4 + payload.len());
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&payload);

    Ok(FeStartupMessage::Startup(StartupMessage {
        version,
        params,
        raw: raw.freeze(),
    }))
}

/// Encode a startup frame from scratch. Used only when the proxy rewrites
/// a parameter; otherwise the received bytes are forwarded verbatim.
pub fn build_startup(version: u32, params: &StartupParams) -> Bytes {
    let body: usize = params.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let total = 4 + 4 + body + 1;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u32(version);
    for (k, v) in params.iter() {
        buf.put_slice(k.as_bytes());
        buf.put_u8(0);
        buf.put_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);
    buf.freeze()
}

/// Encode an ErrorResponse with severity, SQLSTATE code and message fields.
pub fn build_error_response(severity: &str, code: ErrorCode, msg: &str) -> Bytes {
    let body = 4 + (1 + severity.len() + 1) + (1 + code.len() + 1) + (1 + msg.len() + 1) + 1;

    let mut buf = BytesMut::with_capacity(1 + body);
    buf.put_u8(b'E');
    buf.put_u32(body as u32);

    buf.put_u8(b'S');
    buf.put_slice(severity.as_bytes());
    buf.put_u8(0);

    buf.put_u8(b'C');
    buf.put_slice(&code);
    buf.put_u8(0);

    buf.put_u8(b'M');
    buf.put_slice(msg.as_bytes());
    buf.put_u8(0);

    buf.put_u8(0);
    buf.freeze()
}

/// Write an ErrorResponse to the client. Callers are already on a failure
/// path, so they log a write error and move on rather than escalating.
pub async fn send_error_response<S>(
    stream: &mut S,
    severity: &str,
    code: ErrorCode,
    msg: &str,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&build_error_response(severity, code, msg))
        .await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(ps: &[(&str, &str)]) -> StartupParams {
        ps.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn decode(bytes: &[u8]) -> Result<FeStartupMessage, CodecError> {
        let mut input = bytes;
        read_startup(&mut input).await
    }

    #[tokio::test]
    async fn round_trip() {
        let params = pairs(&[("user", "alice"), ("database", "app")]);
        let frame = build_startup(196608, &params);

        match decode(&frame).await.unwrap() {
            FeStartupMessage::Startup(msg) => {
                assert_eq!(msg.version, 196608);
                assert_eq!(msg.params, params);
                assert_eq!(msg.raw_frame(), frame);
            }
            other => panic!("expected startup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_params_is_nine_bytes() {
        let frame = build_startup(196608, &StartupParams::default());
        assert_eq!(frame.len(), 9);

        match decode(&frame).await.unwrap() {
            FeStartupMessage::Startup(msg) => assert!(msg.params.is_empty()),
            other => panic!("expected startup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ssl_request_canonical() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8u32.to_be_bytes());
        frame.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());

        assert!(matches!(
            decode(&frame).await.unwrap(),
            FeStartupMessage::SslRequest
        ));
    }

    #[tokio::test]
    async fn ssl_request_with_trailing_bytes() {
        // A frame longer than 8 bytes still counts as an SSLRequest as long
        // as the payload leads with the magic code.
        let mut frame = Vec::new();
        frame.extend_from_slice(&12u32.to_be_bytes());
        frame.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        frame.extend_from_slice(b"junk");

        assert!(matches!(
            decode(&frame).await.unwrap(),
            FeStartupMessage::SslRequest
        ));
    }

    #[tokio::test]
    async fn other_codes_are_not_ssl_requests() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&9u32.to_be_bytes());
        frame.extend_from_slice(&196608u32.to_be_bytes());
        frame.push(0);

        assert!(matches!(
            decode(&frame).await.unwrap(),
            FeStartupMessage::Startup(_)
        ));
    }

    #[tokio::test]
    async fn length_below_minimum() {
        let frame = 3u32.to_be_bytes();
        assert!(matches!(
            decode(&frame).await,
            Err(CodecError::InvalidFrame(3))
        ));
    }

    #[tokio::test]
    async fn length_above_ceiling() {
        let frame = 100_000u32.to_be_bytes();
        assert!(matches!(
            decode(&frame).await,
            Err(CodecError::FrameTooLarge(100_000))
        ));
    }

    #[tokio::test]
    async fn missing_value_is_malformed() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&196608u32.to_be_bytes());
        payload.extend_from_slice(b"user\0");

        let mut frame = Vec::new();
        frame.extend_from_slice(&(4 + payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        assert!(matches!(
            decode(&frame).await,
            Err(CodecError::MalformedStartup(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        // Declared length of 1000 but the peer closes after the header.
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&1000u32.to_be_bytes()).await.unwrap();
        drop(client);

        match read_startup(&mut server).await {
            Err(CodecError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected i/o error, got {other:?}"),
        }
    }

    #[test]
    fn error_response_layout() {
        let buf = build_error_response("FATAL", SQLSTATE_CONNECTION_FAILURE, "no tls for you");

        assert_eq!(buf[0], b'E');
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, buf.len() - 1);

        let body = &buf[5..];
        assert!(body.starts_with(b"SFATAL\0C08006\0Mno tls for you\0"));
        assert_eq!(body[body.len() - 1], 0);
    }
}
