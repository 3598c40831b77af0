use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregation;
mod bus;
mod config;
mod error;
mod handlers;
mod middleware;
mod publisher;
mod server;
mod simulator;
mod stats;

use aggregation::AggregationStore;
use bus::LocalBus;
use config::Settings;

/// Events buffered per fleet-bus subscriber before it starts lagging.
const BUS_CAPACITY: usize = 1024;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Fleet-wide windowed stats — receivers write, handlers and SSE read.
    pub store: Arc<AggregationStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    settings.validate()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&settings.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        cluster = %settings.cluster,
        period_secs = settings.period_secs,
        prefix = %settings.prefix,
        "fleet stats aggregator starting"
    );

    let cancel = CancellationToken::new();
    let store = Arc::new(AggregationStore::new());
    let bus = LocalBus::new(settings.cluster.clone(), BUS_CAPACITY);

    // ── 1. Aggregator: ingest + rotation ─────────────────────────
    let ingest = tokio::spawn(aggregation::ingest::run(
        store.clone(),
        bus.subscribe(),
        settings.prefix.clone(),
        cancel.clone(),
    ));
    let rotation = tokio::spawn({
        let store = store.clone();
        let period = settings.period();
        let cancel = cancel.clone();
        async move { store.run_rotation(period, cancel).await }
    });

    // ── 2. Demo fleet feeding the bus ────────────────────────────
    let fleet = tokio::spawn(simulator::run(settings.clone(), bus.clone(), cancel.clone()));

    // ── 3. Dashboard API ─────────────────────────────────────────
    let app = server::create_router(Arc::new(AppState { store }));
    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .map_err(error::Error::from)?;
    info!(
        addr = %settings.http_addr,
        bus = bus.cluster(),
        "dashboard API listening: /api/stats, /api/stats/stream"
    );

    // Open SSE streams never finish on their own, so the server is raced
    // against ctrl-c instead of shut down gracefully.
    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.map_err(error::Error::from)?;
        }
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    cancel.cancel();

    simulator::await_tasks([fleet, ingest, rotation]).await;
    info!("fleet stats aggregator stopped");
    Ok(())
}
