//! Connection-level tests: handshake, routing and relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::DEFAULT_RESOLVE_TIMEOUT;
use crate::pqproto::{build_startup, read_startup, FeStartupMessage, StartupParams, SSL_REQUEST_CODE};
use crate::protocol::postgres::PostgresHandler;
use crate::protocol::RoutingMetadata;
use crate::resolver::memory::StaticResolver;
use crate::tls::{SelfSignedTlsProvider, TlsProvider};
use crate::util::flatten_err;

fn params(ps: &[(&str, &str)]) -> StartupParams {
    ps.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn ssl_request() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(8);
    buf.put_u32(SSL_REQUEST_CODE);
    buf.freeze()
}

fn peer() -> SocketAddr {
    "127.0.0.1:54321".parse().unwrap()
}

fn test_server_config() -> anyhow::Result<Arc<rustls::ServerConfig>> {
    SelfSignedTlsProvider.server_config()
}

/// Generate a certificate and build matching server and client configs.
fn generate_tls_pair() -> anyhow::Result<(Arc<rustls::ServerConfig>, TlsConnector)> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server_config = crate::tls::server_config(vec![cert.clone()], key.into())?;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert)?;
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok((server_config, TlsConnector::from(Arc::new(client_config))))
}

async fn decode_frame(frame: &[u8]) -> anyhow::Result<crate::pqproto::StartupMessage> {
    let mut input = frame;
    match read_startup(&mut input).await? {
        FeStartupMessage::Startup(msg) => Ok(msg),
        other => anyhow::bail!("expected startup message, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_derives_tenant_metadata() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(1024);
    let handler = PostgresHandler::new(test_server_config()?);

    let frame = build_startup(
        196608,
        &params(&[("user", "alice.dep42"), ("database", "app")]),
    );
    client.write_all(&frame).await?;

    let handshake = handler.handshake(server).await?;
    let md = &handshake.metadata;
    assert_eq!(md.user(), Some("alice.dep42"));
    assert_eq!(md.database(), Some("app"));
    assert_eq!(md.username(), Some("alice"));
    assert_eq!(md.deployment_id(), Some("dep42"));
    assert!(!md.pooled());
    assert!(!handshake.stream.is_tls());

    // The replayed frame carries the sanitized user, none of the proxy's
    // own keys, and a length header that matches its size.
    let replay = handshake.replay.clone();
    let header_len = u32::from_be_bytes([replay[0], replay[1], replay[2], replay[3]]);
    assert_eq!(header_len as usize, replay.len());

    let msg = decode_frame(&replay).await?;
    assert_eq!(msg.version, 196608);
    assert_eq!(msg.params.get("user"), Some("alice"));
    assert_eq!(msg.params.get("database"), Some("app"));
    assert_eq!(msg.params.get("deployment_id"), None);
    assert_eq!(msg.params.get("pooled"), None);
    assert_eq!(msg.params.get("username"), None);

    Ok(())
}

#[tokio::test]
async fn handshake_forwards_untouched_user_verbatim() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(1024);
    let handler = PostgresHandler::new(test_server_config()?);

    let frame = build_startup(196608, &params(&[("user", "solo"), ("database", "app")]));
    client.write_all(&frame).await?;

    let handshake = handler.handshake(server).await?;
    assert_eq!(handshake.replay, frame);
    assert_eq!(handshake.metadata.user(), Some("solo"));
    assert_eq!(handshake.metadata.username(), None);
    assert_eq!(handshake.metadata.deployment_id(), None);
    assert!(!handshake.metadata.pooled());

    Ok(())
}

#[tokio::test]
async fn handshake_tls_upgrade() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(4096);
    let (server_config, connector) = generate_tls_pair()?;
    let handler = PostgresHandler::new(server_config);

    let proxy = tokio::spawn(async move { handler.handshake(server).await });

    client.write_all(&ssl_request()).await?;
    let mut resp = [0u8; 1];
    client.read_exact(&mut resp).await?;
    assert_eq!(resp[0], b'S');

    let server_name = ServerName::try_from("localhost")?;
    let mut tls_client = connector.connect(server_name, client).await?;
    tls_client
        .write_all(&build_startup(
            196608,
            &params(&[("user", "alice.dep42.pool"), ("database", "app")]),
        ))
        .await?;

    let handshake = proxy.await??;
    assert!(handshake.stream.is_tls());
    assert_eq!(handshake.metadata.username(), Some("alice"));
    assert_eq!(handshake.metadata.deployment_id(), Some("dep42"));
    assert!(handshake.metadata.pooled());

    Ok(())
}

#[tokio::test]
async fn tls_failure_reports_error_to_client() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(4096);
    let handler = PostgresHandler::new(test_server_config()?);

    let proxy = tokio::spawn(async move { handler.handshake(server).await });

    client.write_all(&ssl_request()).await?;
    let mut resp = [0u8; 1];
    client.read_exact(&mut resp).await?;
    assert_eq!(resp[0], b'S');

    // Not a TLS ClientHello.
    client.write_all(b"this is definitely not a client hello").await?;

    let mut response = Vec::new();
    client.read_to_end(&mut response).await?;
    assert_eq!(response[0], b'E');
    assert!(response.windows(7).any(|w| w == b"SFATAL\0"));
    assert!(response.windows(7).any(|w| w == b"C08006\0"));

    let err = proxy
        .await?
        .err()
        .context("handshake should fail on a bad client hello")?;
    assert!(matches!(err, HandshakeError::TlsHandshake(_)));

    Ok(())
}

#[tokio::test]
async fn nested_ssl_request_is_rejected() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(4096);
    let (server_config, connector) = generate_tls_pair()?;
    let handler = PostgresHandler::new(server_config);

    let proxy = tokio::spawn(async move { handler.handshake(server).await });

    client.write_all(&ssl_request()).await?;
    let mut resp = [0u8; 1];
    client.read_exact(&mut resp).await?;
    assert_eq!(resp[0], b'S');

    let server_name = ServerName::try_from("localhost")?;
    let mut tls_client = connector.connect(server_name, client).await?;
    tls_client.write_all(&ssl_request()).await?;

    let err = proxy
        .await?
        .err()
        .context("second SSLRequest should be rejected")?;
    assert!(matches!(err, HandshakeError::NestedSslRequest));

    Ok(())
}

#[tokio::test]
async fn proxy_routes_and_relays() -> anyhow::Result<()> {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend_addr = backend_listener.local_addr()?;

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = proxy_listener.local_addr()?;

    let handler = Arc::new(PostgresHandler::new(test_server_config()?));
    let resolver = Arc::new(StaticResolver::from_mapping(&format!(
        "app={backend_addr}"
    ))?);

    let cancellation_token = CancellationToken::new();
    let proxy = tokio::spawn(task_main(
        handler,
        resolver,
        DEFAULT_RESOLVE_TIMEOUT,
        proxy_listener,
        cancellation_token.clone(),
    ));

    let backend = tokio::spawn(async move {
        let (mut socket, _) = backend_listener.accept().await?;
        let msg = match read_startup(&mut socket).await? {
            FeStartupMessage::Startup(msg) => msg,
            other => anyhow::bail!("backend expected a startup message, got {other:?}"),
        };
        socket.write_all(b"welcome").await?;
        let mut post_startup = [0u8; 4];
        socket.read_exact(&mut post_startup).await?;
        anyhow::Ok((msg, post_startup))
    });

    let mut client = TcpStream::connect(proxy_addr).await?;
    client
        .write_all(&build_startup(
            196608,
            &params(&[("user", "alice.dep42"), ("database", "app")]),
        ))
        .await?;
    client.write_all(b"ping").await?;

    let mut welcome = [0u8; 7];
    client.read_exact(&mut welcome).await?;
    assert_eq!(&welcome, b"welcome");

    let (msg, post_startup) = backend.await??;
    assert_eq!(msg.params.get("user"), Some("alice"));
    assert_eq!(msg.params.get("database"), Some("app"));
    assert_eq!(&post_startup, b"ping");

    drop(client);
    cancellation_token.cancel();
    flatten_err(proxy.await)
}

struct HangingResolver;

#[async_trait]
impl BackendResolver for HangingResolver {
    async fn resolve(&self, _metadata: &RoutingMetadata) -> anyhow::Result<String> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn resolver_timeout_drops_connection() -> anyhow::Result<()> {
    let (mut client, server) = tokio::io::duplex(1024);
    let handler = PostgresHandler::new(test_server_config()?);

    let worker = tokio::spawn(async move {
        handle_client(
            &handler,
            &HangingResolver,
            Duration::from_millis(50),
            server,
            peer(),
        )
        .await
    });

    client
        .write_all(&build_startup(
            196608,
            &params(&[("user", "alice.dep42"), ("database", "app")]),
        ))
        .await?;

    let res = worker.await?;
    assert!(matches!(res, Err(ConnectionError::ResolveTimeout(_))));

    // Nothing was ever written back; the client just sees EOF.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    Ok(())
}

struct FixedResolver(String);

#[async_trait]
impl BackendResolver for FixedResolver {
    async fn resolve(&self, _metadata: &RoutingMetadata) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn backend_dial_failure_drops_connection() -> anyhow::Result<()> {
    // Grab a port nobody is listening on.
    let unused = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = unused.local_addr()?.to_string();
    drop(unused);

    let (mut client, server) = tokio::io::duplex(1024);
    let handler = PostgresHandler::new(test_server_config()?);
    let resolver = FixedResolver(dead_addr.clone());

    let worker = tokio::spawn(async move {
        handle_client(&handler, &resolver, DEFAULT_RESOLVE_TIMEOUT, server, peer()).await
    });

    client
        .write_all(&build_startup(
            196608,
            &params(&[("user", "alice.dep42"), ("database", "app")]),
        ))
        .await?;

    match worker.await? {
        Err(ConnectionError::Dial { addr, .. }) => assert_eq!(addr, dead_addr),
        other => panic!("expected a dial error, got {other:?}"),
    }

    Ok(())
}
