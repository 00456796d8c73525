//! Tenant-routing proxy for PostgreSQL.
//!
//! Listens on the postgres port, reads each client's startup phase, picks a
//! backend from the tenant information encoded in the `user` parameter and
//! relays bytes from then on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Arg;
use futures::future::Either;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pgrelay::config::{ProxyConfig, DEFAULT_HTTP_LISTEN, DEFAULT_LISTEN};
use pgrelay::protocol::postgres::PostgresHandler;
use pgrelay::resolver::memory::StaticResolver;
use pgrelay::tls::{FileTlsProvider, SelfSignedTlsProvider, TlsProvider};
use pgrelay::util::flatten_err;
use pgrelay::{http, logging, proxy, signals};

fn cli() -> clap::Command {
    clap::Command::new("pgrelay")
        .about("Tenant-routing TCP proxy for PostgreSQL")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("listen for incoming client connections on ip:port")
                .default_value(DEFAULT_LISTEN),
        )
        .arg(
            Arg::new("http")
                .long("http")
                .help("listen for health checks on ip:port")
                .default_value(DEFAULT_HTTP_LISTEN),
        )
        .arg(
            Arg::new("backends")
                .short('b')
                .long("backends")
                .help("static database to backend mapping, e.g. db1=host1:5432,db2=host2:5432")
                .required(true),
        )
        .arg(
            Arg::new("tls-key")
                .short('k')
                .long("tls-key")
                .help("path to TLS key for client postgres connections"),
        )
        .arg(
            Arg::new("tls-cert")
                .short('c')
                .long("tls-cert")
                .help("path to TLS cert for client postgres connections"),
        )
        .arg(
            Arg::new("resolve-timeout-secs")
                .long("resolve-timeout-secs")
                .help("upper bound on backend resolution, in seconds")
                .value_parser(clap::value_parser!(u64))
                .default_value("5"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;

    let args = cli().get_matches();
    let config = ProxyConfig {
        listen: args.get_one::<String>("listen").unwrap().parse()?,
        http_listen: args.get_one::<String>("http").unwrap().parse()?,
        resolve_timeout: Duration::from_secs(
            *args.get_one::<u64>("resolve-timeout-secs").unwrap(),
        ),
    };

    let tls_provider: Box<dyn TlsProvider> = match (
        args.get_one::<String>("tls-key"),
        args.get_one::<String>("tls-cert"),
    ) {
        (Some(key_path), Some(cert_path)) => Box::new(FileTlsProvider::new(key_path, cert_path)),
        (None, None) => {
            warn!("no TLS key/cert configured, generating a self-signed certificate");
            Box::new(SelfSignedTlsProvider)
        }
        _ => bail!("either both or neither of --tls-key and --tls-cert must be specified"),
    };
    let tls_config = tls_provider.server_config()?;

    let handler = Arc::new(PostgresHandler::new(tls_config));
    let resolver = Arc::new(StaticResolver::from_mapping(
        args.get_one::<String>("backends").unwrap(),
    )?);

    let ready = Arc::new(AtomicBool::new(false));

    info!("starting http on {}", config.http_listen);
    let http_listener = TcpListener::bind(config.http_listen).await?.into_std()?;
    tokio::spawn(http::task_main(http_listener, Arc::clone(&ready)));

    info!("starting proxy on {}", config.listen);
    let proxy_listener = TcpListener::bind(config.listen).await?;

    let cancellation_token = CancellationToken::new();
    let main_task = tokio::spawn(proxy::task_main(
        handler,
        resolver,
        config.resolve_timeout,
        proxy_listener,
        cancellation_token.clone(),
    ));
    let signals_task = tokio::spawn(signals::handle_signals(cancellation_token));

    ready.store(true, Ordering::Relaxed);

    // The signal task can't ever succeed; the proxy task can error, or can
    // succeed after a cancellation-triggered drain.
    let signal = match futures::future::select(signals_task, main_task).await {
        Either::Left((res, _)) => flatten_err(res)?,
        Either::Right((res, _)) => return flatten_err(res),
    };
    match signal {}
}
