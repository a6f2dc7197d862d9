use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use batch_orchestrator::BatchOrchestrator;
use cost_ledger::PriceTable;
use model_gateway::{GatewayConfig, ModelGateway};
use news_pipeline::{AnalysisService, BroadcastSink, LogSink, PipelineConfig, StagePipeline};
use polygon_client::{PolygonClient, PolygonMarketData, PolygonNewsSource};
use signal_api::{AppState, OnDemandGateway, QuotaLimiter};
use signal_store::SqliteAnalysisStore;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

mod config;
mod scheduler;

use config::AgentConfig;

/// Buffered signal events per `/ws/signals` subscriber
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();
    init_tracing();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting news signal agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    let gateway_config = GatewayConfig::from_env().context("Invalid model gateway configuration")?;
    let prices = PriceTable::from_env().context("Invalid model price table")?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!(
        "  Batch: {} items, {} workers, ${} budget, {}s deadline, every {}s",
        config.batch.max_items,
        config.batch.max_concurrency,
        config.batch.max_cost_budget,
        config.batch.deadline.as_secs(),
        config.batch_interval_secs
    );
    tracing::info!("  First-run news lookback: {}h", config.news_lookback_hours);
    tracing::info!(
        "  On-demand quota: {} requests per {}s",
        config.on_demand_rate_limit,
        config.on_demand_window_secs
    );
    tracing::info!(
        "  Models: screening={} research={} synthesis={}",
        gateway_config.screening_model,
        gateway_config.research_model,
        gateway_config.synthesis_model
    );

    // 3. Store
    let store = Arc::new(
        SqliteAnalysisStore::new(&config.database_url)
            .await
            .with_context(|| format!("Failed to open analysis store at {}", config.database_url))?
            .with_claim_ttl(chrono::Duration::seconds(config.claim_ttl_secs)),
    );
    tracing::info!("Analysis store ready ({})", config.database_url);

    // 4. News source + market data share one rate-limited Polygon client
    let polygon = PolygonClient::new(config.polygon_api_key.clone());
    let source = Arc::new(PolygonNewsSource::new(polygon.clone()));
    let market = Arc::new(PolygonMarketData::new(polygon, config.reaction_threshold_pct));

    // 5. Pipeline, signal sinks, service
    let pipeline = StagePipeline::new(
        ModelGateway::from_config(&gateway_config),
        market,
        prices,
        PipelineConfig::default(),
    );
    let signals = BroadcastSink::new(SIGNAL_CHANNEL_CAPACITY);
    let service = Arc::new(
        AnalysisService::new(pipeline, store)
            .with_sink(Arc::new(LogSink))
            .with_sink(Arc::new(signals.clone())),
    );

    let orchestrator = Arc::new(
        BatchOrchestrator::new(source, Arc::clone(&service)).with_lookback(config.news_lookback()),
    );
    let on_demand = Arc::new(OnDemandGateway::new(
        service,
        QuotaLimiter::new(config.on_demand_rate_limit, config.on_demand_window()),
    ));

    // 6. API server
    let app = signal_api::router(AppState::new(on_demand).with_signal_stream(signals.sender()));
    let listener = tokio::net::TcpListener::bind(config.api_bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.api_bind_addr))?;
    tracing::info!("API listening on {}", config.api_bind_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_shutdown = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    // 7. Scheduler
    let scheduler = tokio::spawn(scheduler::run_scheduler(
        orchestrator,
        config.batch.clone(),
        config.batch_interval(),
        shutdown_rx,
    ));

    // 8. Wait for a signal (or the server dying), then drain
    let server_done = tokio::select! {
        res = shutdown_signal() => {
            res?;
            false
        }
        res = &mut server => {
            match res {
                Ok(Ok(())) => tracing::warn!("API server exited unexpectedly"),
                Ok(Err(e)) => tracing::error!("API server failed: {}", e),
                Err(e) => tracing::error!("API server task panicked: {}", e),
            }
            true
        }
    };

    tracing::info!("Shutting down, waiting for the current batch to finish...");
    let _ = shutdown_tx.send(true);

    match scheduler.await {
        Ok(batches) => tracing::info!("Scheduler stopped after {} batches", batches),
        Err(e) => tracing::error!("Scheduler task failed: {}", e),
    }
    if !server_done {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("API server failed during shutdown: {}", e),
            Err(e) => tracing::error!("API server task panicked: {}", e),
        }
    }

    tracing::info!("Signal agent stopped");
    Ok(())
}
