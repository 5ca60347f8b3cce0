//! ocspxy — a caching forward proxy for OCSP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ocspxy::config::Config;
use ocspxy::proxy::OcspProxy;
use ocspxy::refresher::Refresher;
use ocspxy::state::AppState;
use ocspxy::store::{CacheStore, Store};
use ocspxy::upstream::Fetcher;
use ocspxy::writer::WriterService;
use pingora::server::Server;
use pingora::services::background::background_service;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    if let Err(e) = run_server() {
        eprintln!("ocspxy failed to start: {e:#}");
        std::process::exit(1);
    }
}

fn run_server() -> Result<()> {
    let config = Config::parse();
    init_logging(config.verbose)?;

    tracing::info!(
        bind = %config.bind_addr(),
        redis_url = %config.redis_url,
        "starting ocspxy"
    );

    let store: Arc<dyn CacheStore> =
        Arc::new(Store::new(&config.redis_url).context("constructing redis store")?);
    let fetcher = Fetcher::new(config.upstream_timeout);
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        fetcher,
        write_tx,
    });

    let mut server = Server::new(None).map_err(|e| anyhow::anyhow!("failed to create pingora server: {e}"))?;
    server.bootstrap();

    let writer_service = background_service(
        "write-serializer",
        WriterService {
            rx: Some(write_rx),
            store: store.clone(),
        },
    );
    server.add_service(writer_service);

    let refresher_service = background_service("refresher", Refresher::new(state.clone()));
    server.add_service(refresher_service);

    let proxy = OcspProxy::new(state.clone());
    let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&config.bind_addr());
    server.add_service(proxy_service);

    let mut metrics_service = pingora::services::listening::Service::prometheus_http_service();
    metrics_service.add_tcp(&config.metrics_bind);
    server.add_service(metrics_service);

    tracing::info!("ocspxy ready");
    tracing::info!("  client surface: {}", config.bind_addr());
    tracing::info!("  metrics: http://{}/metrics", config.metrics_bind);

    server.run_forever();
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .with(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        );

    subscriber.init();
    Ok(())
}
