//! Liveness/readiness HTTP surface.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::info;

/// Serve `/healthz` and `/readyz` until the process exits.
///
/// `/healthz` answers `200 ok` as long as the process is alive; `/readyz`
/// flips to `200 ready` once the startup wiring has marked the shared flag.
pub async fn task_main(
    listener: std::net::TcpListener,
    ready: Arc<AtomicBool>,
) -> anyhow::Result<Infallible> {
    let make_service = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ready = Arc::clone(&ready);
                async move { handle(&req, &ready) }
            }))
        }
    });

    info!("health server listening");
    hyper::Server::from_tcp(listener)?.serve(make_service).await?;

    bail!("health server exited unexpectedly")
}

fn handle(req: &Request<Body>, ready: &AtomicBool) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
        (&Method::GET, "/readyz") => {
            if ready.load(Ordering::Relaxed) {
                text(StatusCode::OK, "ready")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response must build")
}
