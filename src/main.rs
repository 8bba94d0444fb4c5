mod analytics;
mod background;
mod batched_engine;
mod cache;
mod config;
mod deberta_engine;
mod engine;
mod evaluation;
mod routes;
mod tabular;
mod types;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use analytics::PredictionLog;
use background::BackgroundWriter;
use batched_engine::BatchedClassifier;
use cache::PredictionCache;
use config::{BatchConfig, CacheSettings, Config, LogStoreSettings};
use deberta_engine::{ClassifierConfig, DebertaClassifier};
use routes::{AppState, ModelDescriptor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,topical=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting topical with config: {:?}", config);

    if config.model_id.is_none() && config.model_path.is_none() {
        anyhow::bail!("Either --model-id or --model-path must be provided");
    }

    // No serving without a model: a load failure aborts startup
    tracing::info!("Loading classification model...");
    let classifier = DebertaClassifier::new(ClassifierConfig::from(&config)).await?;
    let classes = classifier.classes();
    tracing::info!(classes = ?classes, "Model loaded successfully");

    let batch_config = BatchConfig::from(&config);
    let (engine, processor) = BatchedClassifier::new(batch_config.clone(), classifier);
    tokio::spawn(async move {
        tracing::info!("Starting batch processor");
        if let Err(e) = processor.run_forever().await {
            tracing::error!("Batch processor error: {}", e);
        }
    });

    // Both stores degrade to a disabled state rather than failing startup
    let prediction_cache = Arc::new(PredictionCache::new(CacheSettings::from(&config)));
    if !prediction_cache.connect().await {
        tracing::warn!("Cache unavailable - continuing without caching");
    }

    let prediction_log = Arc::new(PredictionLog::new(LogStoreSettings::from(&config)));
    if !prediction_log.connect().await {
        tracing::warn!("Analytics store unavailable - continuing without logging");
    }

    let shutdown = CancellationToken::new();
    let (writer, worker) = BackgroundWriter::new(
        config.write_queue_capacity,
        prediction_cache.clone(),
        prediction_log.clone(),
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let model = Arc::new(ModelDescriptor {
        name: config
            .model_id
            .clone()
            .or_else(|| {
                config
                    .model_path
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string()),
        version: config.model_version.clone(),
        classes,
    });

    let state = AppState {
        engine: Arc::new(engine),
        cache: prediction_cache.clone(),
        analytics: prediction_log.clone(),
        writer,
        model,
        api_key: config.api_key.clone(),
        results_dir: config.results_dir.clone(),
    };

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = routes::router(state)
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Batch size: {}, Tick duration: {:?}",
        batch_config.batch_size,
        batch_config.tick_duration
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued best-effort writes, then release the store handles
    tracing::info!("Shutting down...");
    shutdown.cancel();
    let _ = worker_handle.await;
    prediction_cache.close().await;
    prediction_log.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
