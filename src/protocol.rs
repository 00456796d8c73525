//! Contracts between the dispatch engine and its protocol handlers.
//!
//! The engine only ever sees these types: a handler consumes the startup
//! phase of a fresh client connection and hands back routing metadata, the
//! (possibly TLS-wrapped) connection and the bytes to replay to the
//! backend. Which wire protocol was spoken is the handler's business.

pub mod postgres;

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::pqproto::CodecError;
use crate::stream::Stream;

/// Startup parameters the proxy understands.
pub const PARAM_USER: &str = "user";
pub const PARAM_DATABASE: &str = "database";

/// Metadata keys derived during handshake. These are proxy-internal and
/// must never be forwarded to a backend.
pub const META_USERNAME: &str = "username";
pub const META_DEPLOYMENT_ID: &str = "deployment_id";
pub const META_POOLED: &str = "pooled";

pub fn is_derived_key(key: &str) -> bool {
    matches!(key, META_USERNAME | META_DEPLOYMENT_ID | META_POOLED)
}

/// Per-connection key/value map produced during handshake and consumed by
/// the backend resolver. Not mutated after the handshake returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingMetadata(HashMap<String, String>);

impl RoutingMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_owned(), value.to_owned());
    }

    /// Raw `user` field exactly as the client sent it.
    pub fn user(&self) -> Option<&str> {
        self.get(PARAM_USER)
    }

    pub fn database(&self) -> Option<&str> {
        self.get(PARAM_DATABASE)
    }

    /// User name with the tenant routing suffix stripped.
    pub fn username(&self) -> Option<&str> {
        self.get(META_USERNAME)
    }

    pub fn deployment_id(&self) -> Option<&str> {
        self.get(META_DEPLOYMENT_ID)
    }

    pub fn pooled(&self) -> bool {
        self.get(META_POOLED) == Some("true")
    }
}

/// Everything the dispatch engine needs to start relaying.
pub struct Handshake<S> {
    pub metadata: RoutingMetadata,
    /// Authoritative connection for the relay. May be a TLS wrapper around
    /// the socket the handshake started on.
    pub stream: Stream<S>,
    /// Bytes to write to the backend before relaying, exactly as the
    /// backend expects them.
    pub replay: Bytes,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("client sent an SSLRequest over an established TLS session")]
    NestedSslRequest,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),

    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),
}

/// Startup-phase interpreter for one wire protocol.
#[async_trait]
pub trait ProtocolHandler<S>: Send + Sync
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Consume the startup phase of `stream`. Implementations may replace
    /// the connection (e.g. a TLS upgrade); the returned stream is the one
    /// to keep using.
    async fn handshake(&self, stream: S) -> Result<Handshake<S>, HandshakeError>;
}
