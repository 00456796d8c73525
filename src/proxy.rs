//! Dispatch engine: accept loop, per-connection lifecycle and byte relay.

pub mod copy_bidirectional;
#[cfg(test)]
mod tests;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::TryFutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTracker;
use tracing::{error, info, info_span, Instrument};

use crate::protocol::{Handshake, HandshakeError, ProtocolHandler};
use crate::resolver::BackendResolver;
use crate::util::run_until_cancelled;

/// Everything that can end a single client connection. None of these are
/// fatal to the server; the task logs and the sockets drop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("backend resolution failed: {0:#}")]
    Resolve(#[source] anyhow::Error),

    #[error("backend resolution timed out after {0:?}")]
    ResolveTimeout(Duration),

    #[error("failed to dial backend at {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("failed to replay startup message to {addr}: {source}")]
    Replay { addr: String, source: io::Error },

    #[error("relay failed: {0}")]
    Relay(#[from] copy_bidirectional::ErrorSource),
}

/// Accept connections until cancelled, spawning one task per client.
///
/// A failed accept is fatal; per-connection errors are logged by the task
/// that hit them and never affect the loop. On cancellation the listener
/// closes first and in-flight connections drain.
pub async fn task_main<H, R>(
    handler: Arc<H>,
    resolver: Arc<R>,
    resolve_timeout: Duration,
    listener: TcpListener,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()>
where
    H: ProtocolHandler<TcpStream> + 'static,
    R: BackendResolver + 'static,
{
    // Accepted sockets inherit the keepalive setting from the listener.
    socket2::SockRef::from(&listener).set_keepalive(true)?;

    let connections = TaskTracker::new();

    while let Some(accept_result) =
        run_until_cancelled(listener.accept(), &cancellation_token).await
    {
        let (socket, peer_addr) = accept_result?;

        let session_id = uuid::Uuid::new_v4();
        let handler = Arc::clone(&handler);
        let resolver = Arc::clone(&resolver);

        connections.spawn(
            async move {
                socket
                    .set_nodelay(true)
                    .context("failed to set socket option")?;

                handle_client(&*handler, &*resolver, resolve_timeout, socket, peer_addr).await?;
                anyhow::Ok(())
            }
            .unwrap_or_else(move |e| {
                error!(%peer_addr, "per-client task finished with an error: {e:#}");
            })
            .instrument(info_span!("handle_client", %session_id, %peer_addr)),
        );
    }

    connections.close();
    drop(listener);
    connections.wait().await;

    info!("all client connections have finished");
    Ok(())
}

/// One client from handshake to teardown. Sockets close on every exit path
/// by being dropped, including unwinds.
async fn handle_client<H, R, S>(
    handler: &H,
    resolver: &R,
    resolve_timeout: Duration,
    stream: S,
    peer_addr: SocketAddr,
) -> Result<(), ConnectionError>
where
    H: ProtocolHandler<S> + ?Sized,
    R: BackendResolver + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Handshake {
        metadata,
        stream: mut client,
        replay,
    } = handler.handshake(stream).await?;

    let addr = timeout(resolve_timeout, resolver.resolve(&metadata))
        .await
        .map_err(|_| ConnectionError::ResolveTimeout(resolve_timeout))?
        .map_err(ConnectionError::Resolve)?;

    info!(
        %addr,
        user = metadata.user().unwrap_or_default(),
        deployment_id = metadata.deployment_id().unwrap_or_default(),
        pooled = metadata.pooled(),
        "routing client to backend"
    );

    let mut backend = TcpStream::connect(&addr)
        .await
        .map_err(|source| ConnectionError::Dial {
            addr: addr.clone(),
            source,
        })?;

    if !replay.is_empty() {
        backend
            .write_all(&replay)
            .await
            .map_err(|source| ConnectionError::Replay {
                addr: addr.clone(),
                source,
            })?;
    }

    let (tx, rx) = copy_bidirectional::copy_bidirectional(&mut client, &mut backend).await?;
    info!(%peer_addr, bytes_to_backend = tx, bytes_to_client = rx, "connection finished");
    Ok(())
}
