//! PostgreSQL startup-phase handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::pqproto::{
    self, FeStartupMessage, StartupMessage, StartupParams, SQLSTATE_CONNECTION_FAILURE, SSL_ACCEPT,
};
use crate::protocol::{
    is_derived_key, Handshake, HandshakeError, ProtocolHandler, RoutingMetadata,
    META_DEPLOYMENT_ID, META_POOLED, META_USERNAME, PARAM_USER,
};
use crate::stream::Stream;
use crate::tenant::TenantAddress;

/// Interprets the libpq startup phase: the optional in-band TLS upgrade,
/// then one startup message, from which tenant routing metadata is derived.
pub struct PostgresHandler {
    acceptor: TlsAcceptor,
}

impl PostgresHandler {
    pub fn new(tls: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls),
        }
    }
}

#[async_trait]
impl<S> ProtocolHandler<S> for PostgresHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handshake(&self, stream: S) -> Result<Handshake<S>, HandshakeError> {
        let mut stream = Stream::from_raw(stream);

        loop {
            match pqproto::read_startup(&mut stream).await? {
                FeStartupMessage::SslRequest => {
                    // The client may upgrade only once.
                    let Stream::Raw { mut raw } = stream else {
                        return Err(HandshakeError::NestedSslRequest);
                    };
                    raw.write_all(&[SSL_ACCEPT]).await?;

                    match self.acceptor.accept(raw).into_fallible().await {
                        Ok(tls) => stream = Stream::Tls { tls: Box::new(tls) },
                        Err((error, mut raw)) => {
                            // Best effort: the client is still listening in
                            // cleartext at this point.
                            let msg = format!("TLS handshake failed: {error}");
                            pqproto::send_error_response(
                                &mut raw,
                                "FATAL",
                                SQLSTATE_CONNECTION_FAILURE,
                                &msg,
                            )
                            .await
                            .inspect_err(|e| debug!("could not report TLS failure to client: {e}"))
                            .ok();
                            return Err(HandshakeError::TlsHandshake(error));
                        }
                    }
                }
                FeStartupMessage::Startup(msg) => {
                    debug!(
                        version = msg.version,
                        tls = stream.is_tls(),
                        "received startup message"
                    );
                    return Ok(finish(msg, stream));
                }
            }
        }
    }
}

/// Turn a decoded startup message into routing metadata plus the frame to
/// replay to the backend.
fn finish<S>(msg: StartupMessage, stream: Stream<S>) -> Handshake<S> {
    let mut metadata = RoutingMetadata::default();
    for (k, v) in msg.params.iter() {
        metadata.insert(k, v);
    }

    let mut rewritten_user = None;
    if let Some(user) = msg.params.get(PARAM_USER) {
        let tenant = TenantAddress::parse(user);
        metadata.insert(META_POOLED, if tenant.pooled { "true" } else { "false" });
        if let Some(id) = &tenant.deployment_id {
            metadata.insert(META_DEPLOYMENT_ID, id);
        }
        if let Some(name) = &tenant.username {
            metadata.insert(META_USERNAME, name);
            if name.as_str() != user {
                rewritten_user = Some(name.clone());
            }
        }
    }

    // Unless the user name changed, the backend gets the client's bytes
    // verbatim.
    let replay = match &rewritten_user {
        Some(user) => pqproto::build_startup(msg.version, &rewrite_params(&msg.params, user)),
        None => msg.raw_frame(),
    };

    Handshake {
        metadata,
        stream,
        replay,
    }
}

/// Parameter list to re-emit to the backend: the sanitized user name in
/// place of the tenant-encoded one. Keys the proxy reserves for itself are
/// dropped in case a client sent parameters by those names.
fn rewrite_params(params: &StartupParams, user: &str) -> StartupParams {
    params
        .iter()
        .filter(|&(k, _)| !is_derived_key(k))
        .map(|(k, v)| {
            if k == PARAM_USER {
                (k.to_owned(), user.to_owned())
            } else {
                (k.to_owned(), v.to_owned())
            }
        })
        .collect()
}
