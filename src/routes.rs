use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures::future::join_all;
use metrics::counter;
use serde::Deserialize;
use uuid::Uuid;

use crate::analytics::{PredictionLog, PredictionRecord};
use crate::background::{BackgroundWriter, WriteJob};
use crate::cache::PredictionCache;
use crate::engine::Engine;
use crate::evaluation;
use crate::tabular;
use crate::types::{
    BatchPredictRequest, BatchPredictResponse, CacheClearResponse, CachedPrediction,
    DetailedHealthResponse, EvalOutcome, EvalRequest, EvalResponse, FeatureFlags,
    FileEvalResponse, HealthResponse, InfoResponse, LabelAccuracyResponse,
    LowConfidenceResponse, MAX_BATCH_TEXTS, MAX_EVAL_ITEMS, MAX_TEXT_CHARS, ModelHealth,
    PredictRequest, PredictResponse, Prediction, ReadinessResponse, RootResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine + Send + Sync>,
    pub cache: Arc<PredictionCache>,
    pub analytics: Arc<PredictionLog>,
    pub writer: BackgroundWriter,
    pub model: Arc<ModelDescriptor>,
    pub api_key: Option<String>,
    pub results_dir: PathBuf,
}

#[derive(Debug)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: String,
    pub classes: Vec<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/health/detailed", get(health_detailed))
        .route("/info", get(info))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/predict/batch/evaluate", post(predict_batch_evaluate))
        .route("/predict/batch/from-file", post(predict_batch_from_file))
        .route("/stats", get(stats))
        .route("/stats/low-confidence", get(stats_low_confidence))
        .route("/stats/accuracy", get(stats_accuracy))
        .route("/cache/clear", get(cache_clear))
        .with_state(state)
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: "topical",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        model_loaded: true,
    })
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    // The model is loaded before the listener binds, so readiness only
    // varies in the per-store connectivity flags
    Json(ReadinessResponse {
        ready: true,
        model_loaded: true,
        cache_connected: state.cache.is_connected(),
        analytics_connected: state.analytics.is_connected(),
    })
}

async fn health_detailed(State(state): State<AppState>) -> Json<DetailedHealthResponse> {
    Json(DetailedHealthResponse {
        timestamp: Utc::now(),
        api: "healthy",
        model: ModelHealth {
            status: "loaded",
            classes: state.model.classes.clone(),
        },
        cache: state.cache.health_check().await,
        analytics: state.analytics.health_check().await,
    })
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        model_name: state.model.name.clone(),
        model_version: state.model.version.clone(),
        num_classes: state.model.classes.len(),
        classes: state.model.classes.clone(),
        features: FeatureFlags {
            caching: state.cache.is_connected(),
            analytics: state.analytics.is_connected(),
            batch_prediction: true,
        },
    })
}

#[tracing::instrument(skip(state, headers, request), fields(text_chars = request.text.chars().count(), use_cache = request.use_cache))]
async fn predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    check_api_key(state.api_key.as_deref(), &headers)?;
    let client = ClientMeta::from_headers(&headers);
    run_prediction(&state, request, client).await.map(Json)
}

#[derive(Debug, Default, Clone)]
struct ClientMeta {
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl ClientMeta {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            ip_address: headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string()),
            user_agent: headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
        }
    }
}

/// The per-request control flow: cache lookup, inference on miss,
/// then fire-and-forget cache population and analytics logging. Only
/// an inference failure may fail the request.
async fn run_prediction(
    state: &AppState,
    request: PredictRequest,
    client: ClientMeta,
) -> Result<PredictResponse, ApiError> {
    let started = Instant::now();
    validate_text(&request.text)?;
    counter!("prediction_requests_total").increment(1);

    if request.use_cache {
        if let Some(hit) = state.cache.get(&request.text).await {
            let latency_ms = elapsed_ms(started);
            tracing::info!(label = %hit.label, latency_ms, "Cache hit");
            state
                .writer
                .submit(WriteJob::AppendLogRecord(log_record(
                    state, &request.text, &hit.label, hit.confidence, latency_ms, true, &client,
                )));
            let prediction = Prediction::from(hit);
            return Ok(PredictResponse {
                text: request.text,
                label: prediction.label,
                confidence: prediction.confidence,
                distribution: prediction.distribution,
                latency_ms,
                cached: true,
            });
        }
    }

    let prediction = state
        .engine
        .predict(request.text.clone())
        .await
        .map_err(|e| {
            counter!("inference_errors_total").increment(1);
            tracing::error!(error = %e, "Inference failed");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("inference failed: {e}"),
            )
        })?;

    let latency_ms = elapsed_ms(started);
    tracing::info!(label = %prediction.label, latency_ms, "Prediction served");

    // Both writes are queued without awaiting; the response does not
    // wait on either store
    state.writer.submit(WriteJob::StoreCacheEntry {
        text: request.text.clone(),
        value: CachedPrediction::from(&prediction),
    });
    state.writer.submit(WriteJob::AppendLogRecord(log_record(
        state,
        &request.text,
        &prediction.label,
        prediction.confidence,
        latency_ms,
        false,
        &client,
    )));

    Ok(PredictResponse {
        text: request.text,
        label: prediction.label,
        confidence: prediction.confidence,
        distribution: prediction.distribution,
        latency_ms,
        cached: false,
    })
}

#[tracing::instrument(skip(state, request), fields(batch_size = request.texts.len()))]
async fn predict_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchPredictRequest>,
) -> Result<Json<BatchPredictResponse>, ApiError> {
    if request.texts.len() > MAX_BATCH_TEXTS {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("at most {MAX_BATCH_TEXTS} texts per batch"),
        ));
    }
    for text in &request.texts {
        validate_text(text)?;
    }

    let started = Instant::now();
    let futures = request
        .texts
        .iter()
        .cloned()
        .map(|text| state.engine.predict(text));
    let results = join_all(futures).await;

    let mut predictions = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(prediction) => predictions.push(prediction),
            Err(e) => {
                tracing::error!(input_index = index, error = %e, "Batch item inference failed");
                return Err(ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("inference failed: {e}"),
                ));
            }
        }
    }

    let latency_ms = elapsed_ms(started);
    // Batch workloads are assumed non-repetitive: no cache lookup or
    // population, but every item is logged with apportioned latency
    let per_item_ms = latency_ms / request.texts.len().max(1) as f64;
    for (text, prediction) in request.texts.iter().zip(&predictions) {
        state.writer.submit(WriteJob::AppendLogRecord(log_record(
            &state,
            text,
            &prediction.label,
            prediction.confidence,
            per_item_ms,
            false,
            &ClientMeta::default(),
        )));
    }

    tracing::info!(count = predictions.len(), latency_ms, "Batch prediction served");
    Ok(Json(BatchPredictResponse {
        id: format!("batch-{}", Uuid::new_v4().simple()),
        count: predictions.len(),
        predictions,
        latency_ms,
    }))
}

#[tracing::instrument(skip(state, request), fields(item_count = request.items.len()))]
async fn predict_batch_evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvalRequest>,
) -> Result<Json<EvalResponse>, ApiError> {
    if request.items.len() > MAX_EVAL_ITEMS {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("at most {MAX_EVAL_ITEMS} items per evaluation"),
        ));
    }
    run_evaluation(&state, request).await.map(Json)
}

/// Evaluation runs every item; a per-item failure is counted and
/// excluded from metrics rather than aborting the batch.
async fn run_evaluation(
    state: &AppState,
    request: EvalRequest,
) -> Result<EvalResponse, ApiError> {
    let started = Instant::now();

    let futures = request.items.iter().map(|item| {
        let engine = state.engine.clone();
        let text = item.text.clone();
        async move {
            let item_started = Instant::now();
            let result = match validate_text(&text) {
                Ok(()) => engine.predict(text).await,
                Err(e) => Err(anyhow::anyhow!(e.detail)),
            };
            (result, elapsed_ms(item_started))
        }
    });
    let results = join_all(futures).await;

    let mut outcomes = Vec::new();
    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();
    let mut failed = 0usize;

    for (index, (item, (result, latency_ms))) in
        request.items.iter().zip(results).enumerate()
    {
        match result {
            Ok(prediction) => {
                let is_correct = item
                    .ground_truth
                    .as_ref()
                    .map(|gt| *gt == prediction.label);
                if let Some(gt) = &item.ground_truth {
                    y_true.push(gt.clone());
                    y_pred.push(prediction.label.clone());
                }
                outcomes.push(EvalOutcome {
                    id: item.id.clone().unwrap_or_else(|| index.to_string()),
                    text: item.text.clone(),
                    label: prediction.label,
                    confidence: prediction.confidence,
                    ground_truth: item.ground_truth.clone(),
                    is_correct,
                    latency_ms,
                });
            }
            Err(e) => {
                tracing::error!(item_index = index, error = %e, "Evaluation item failed");
                failed += 1;
            }
        }
    }

    let metrics = if request.include_metrics {
        evaluation::compute_metrics(&y_true, &y_pred)
    } else {
        None
    };
    if let Some(metrics) = &metrics {
        tracing::info!(accuracy = metrics.overall.accuracy, "Evaluation metrics computed");
    }

    Ok(EvalResponse {
        total_items: request.items.len(),
        successful: outcomes.len(),
        failed,
        predictions: outcomes,
        metrics,
        execution_time_ms: elapsed_ms(started),
        timestamp: Utc::now(),
    })
}

#[tracing::instrument(skip(state, multipart))]
async fn predict_batch_from_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FileEvalResponse>, ApiError> {
    let mut data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid upload: {e}")))?
    {
        if field.name() == Some("file") || field.file_name().is_some() {
            data = Some(field.bytes().await.map_err(|e| {
                ApiError::new(StatusCode::BAD_REQUEST, format!("invalid upload: {e}"))
            })?);
            break;
        }
    }
    let data =
        data.ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing file field"))?;

    let items = tabular::parse_items(&data)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid file: {e}")))?;
    if items.len() > MAX_EVAL_ITEMS {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("at most {MAX_EVAL_ITEMS} rows per file"),
        ));
    }
    tracing::info!(rows = items.len(), "Tabular upload parsed");

    let response = run_evaluation(
        &state,
        EvalRequest {
            items,
            include_metrics: true,
        },
    )
    .await?;

    let rendered = tabular::render_outcomes(&response.predictions).map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render results: {e}"),
        )
    })?;
    let file_name = format!("batch_results_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
    let output_path = state.results_dir.join(file_name);
    tokio::fs::create_dir_all(&state.results_dir)
        .await
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create results directory: {e}"),
            )
        })?;
    tokio::fs::write(&output_path, rendered.as_bytes())
        .await
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to write results file: {e}"),
            )
        })?;
    tracing::info!(path = %output_path.display(), "Results file written");

    let preview = response.predictions.iter().take(10).cloned().collect();
    Ok(Json(FileEvalResponse {
        status: "success",
        output_file: output_path.display().to_string(),
        batch: response,
        preview,
    }))
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    hours: Option<i32>,
}

async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Json<crate::analytics::StatsReport> {
    let hours = params.hours.unwrap_or(24).clamp(1, 24 * 365);
    Json(state.analytics.get_stats(hours).await)
}

#[derive(Debug, Deserialize)]
struct LowConfidenceParams {
    threshold: Option<f64>,
    limit: Option<i64>,
}

async fn stats_low_confidence(
    State(state): State<AppState>,
    Query(params): Query<LowConfidenceParams>,
) -> Json<LowConfidenceResponse> {
    let threshold = params.threshold.unwrap_or(0.7).clamp(0.0, 1.0);
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let predictions = state.analytics.get_low_confidence(threshold, limit).await;
    Json(LowConfidenceResponse {
        threshold,
        count: predictions.len(),
        predictions,
    })
}

async fn stats_accuracy(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Json<LabelAccuracyResponse> {
    let hours = params.hours.unwrap_or(24).clamp(1, 24 * 365);
    Json(LabelAccuracyResponse {
        window_hours: hours,
        labels: state.analytics.get_label_accuracy(hours).await,
    })
}

async fn cache_clear(State(state): State<AppState>) -> Json<CacheClearResponse> {
    let flushed = state.cache.flush_all().await;
    if flushed {
        tracing::warn!("Cache flushed by admin request");
    }
    Json(CacheClearResponse {
        status: if flushed { "cleared" } else { "unavailable" },
        timestamp: Utc::now(),
    })
}

fn validate_text(text: &str) -> Result<(), ApiError> {
    if text.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "text must not be empty",
        ));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("text must be at most {MAX_TEXT_CHARS} characters"),
        ));
    }
    Ok(())
}

/// The shared secret is only enforced against a supplied header; a
/// request without the header is treated as anonymous.
fn check_api_key(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    if let (Some(expected), Some(provided)) = (
        expected,
        headers.get("x-api-key").and_then(|v| v.to_str().ok()),
    ) {
        if provided != expected {
            return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid API key"));
        }
    }
    Ok(())
}

fn log_record(
    state: &AppState,
    text: &str,
    label: &str,
    confidence: f64,
    latency_ms: f64,
    cached: bool,
    client: &ClientMeta,
) -> PredictionRecord {
    PredictionRecord {
        text: text.to_string(),
        label: label.to_string(),
        confidence,
        latency_ms,
        model_version: state.model.version.clone(),
        cached,
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, LogStoreSettings};
    use crate::types::EvalItem;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct StubEngine {
        fail_text: Option<String>,
    }

    #[async_trait]
    impl Engine for StubEngine {
        async fn predict(&self, text: String) -> anyhow::Result<Prediction> {
            if self.fail_text.as_deref() == Some(text.as_str()) {
                anyhow::bail!("synthetic inference failure");
            }
            let label = if text.to_lowercase().contains("stock") {
                "BUSINESS"
            } else {
                "TECHNOLOGY"
            };
            let mut distribution = BTreeMap::new();
            for candidate in ["BUSINESS", "TECHNOLOGY"] {
                let p = if candidate == label { 0.9 } else { 0.1 };
                distribution.insert(candidate.to_string(), p);
            }
            Ok(Prediction {
                label: label.to_string(),
                confidence: 0.9,
                distribution,
            })
        }
    }

    fn test_state(fail_text: Option<&str>) -> AppState {
        let cache = Arc::new(PredictionCache::new(CacheSettings {
            url: "redis://localhost:6379".to_string(),
            ttl: Duration::from_secs(60),
            op_timeout: Duration::from_secs(5),
            max_in_flight: 2,
        }));
        let analytics = Arc::new(PredictionLog::new(LogStoreSettings {
            host: "localhost".to_string(),
            port: 5432,
            database: "topical".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            pool_min: 1,
            pool_max: 2,
            op_timeout: Duration::from_secs(5),
        }));
        let (writer, _worker) = BackgroundWriter::new(
            64,
            cache.clone(),
            analytics.clone(),
            CancellationToken::new(),
        );
        AppState {
            engine: Arc::new(StubEngine {
                fail_text: fail_text.map(|s| s.to_string()),
            }),
            cache,
            analytics,
            writer,
            model: Arc::new(ModelDescriptor {
                name: "stub-classifier".to_string(),
                version: "test".to_string(),
                classes: vec!["BUSINESS".to_string(), "TECHNOLOGY".to_string()],
            }),
            api_key: None,
            results_dir: PathBuf::from("batch_results"),
        }
    }

    fn eval_items(specs: &[(&str, Option<&str>)]) -> Vec<EvalItem> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (text, gt))| EvalItem {
                id: Some(i.to_string()),
                text: text.to_string(),
                ground_truth: gt.map(|s| s.to_string()),
            })
            .collect()
    }

    #[tokio::test]
    async fn cached_and_uncached_results_agree() {
        let state = test_state(None);
        let with_cache = run_prediction(
            &state,
            PredictRequest {
                text: "stock markets tumble".to_string(),
                use_cache: true,
            },
            ClientMeta::default(),
        )
        .await
        .unwrap();
        let without_cache = run_prediction(
            &state,
            PredictRequest {
                text: "stock markets tumble".to_string(),
                use_cache: false,
            },
            ClientMeta::default(),
        )
        .await
        .unwrap();

        assert_eq!(with_cache.label, without_cache.label);
        assert_eq!(with_cache.confidence, without_cache.confidence);
        assert_eq!(with_cache.distribution, without_cache.distribution);
        // cache is degraded in tests, so neither path is a hit
        assert!(!with_cache.cached);
        assert!(!without_cache.cached);
    }

    #[tokio::test]
    async fn empty_and_oversized_text_are_rejected() {
        let state = test_state(None);
        let empty = run_prediction(
            &state,
            PredictRequest {
                text: String::new(),
                use_cache: true,
            },
            ClientMeta::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(empty.status, StatusCode::UNPROCESSABLE_ENTITY);

        let oversized = run_prediction(
            &state,
            PredictRequest {
                text: "x".repeat(MAX_TEXT_CHARS + 1),
                use_cache: true,
            },
            ClientMeta::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(oversized.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn inference_failure_is_a_500() {
        let state = test_state(Some("boom"));
        let err = run_prediction(
            &state,
            PredictRequest {
                text: "boom".to_string(),
                use_cache: false,
            },
            ClientMeta::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn evaluation_tolerates_item_failures() {
        let state = test_state(Some("boom"));
        let request = EvalRequest {
            items: eval_items(&[
                ("Apple ships new laptop", Some("TECHNOLOGY")),
                ("stock rally continues", Some("BUSINESS")),
                ("boom", Some("TECHNOLOGY")),
                ("chip fabs expand", Some("TECHNOLOGY")),
                ("stocks fall again", Some("TECHNOLOGY")),
            ]),
            include_metrics: true,
        };

        let response = run_evaluation(&state, request).await.unwrap();
        assert_eq!(response.total_items, 5);
        assert_eq!(response.successful, 4);
        assert_eq!(response.failed, 1);
        assert_eq!(response.predictions.len(), 4);

        let metrics = response.metrics.unwrap();
        assert_eq!(metrics.overall.total_samples, 4);
        assert!((metrics.overall.accuracy - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metrics_skipped_without_ground_truth_or_opt_out() {
        let state = test_state(None);
        let no_gt = run_evaluation(
            &state,
            EvalRequest {
                items: eval_items(&[("Apple ships new laptop", None)]),
                include_metrics: true,
            },
        )
        .await
        .unwrap();
        assert!(no_gt.metrics.is_none());

        let opted_out = run_evaluation(
            &state,
            EvalRequest {
                items: eval_items(&[("Apple ships new laptop", Some("TECHNOLOGY"))]),
                include_metrics: false,
            },
        )
        .await
        .unwrap();
        assert!(opted_out.metrics.is_none());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let state = test_state(None);
        let request = BatchPredictRequest {
            texts: vec!["headline".to_string(); MAX_BATCH_TEXTS + 1],
        };
        let err = predict_batch(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn batch_predicts_every_text() {
        let state = test_state(None);
        let request = BatchPredictRequest {
            texts: vec![
                "stock rally continues".to_string(),
                "new chip ships".to_string(),
            ],
        };
        let Json(response) = predict_batch(State(state), Json(request)).await.unwrap();
        assert_eq!(response.count, 2);
        assert_eq!(response.predictions[0].label, "BUSINESS");
        assert_eq!(response.predictions[1].label, "TECHNOLOGY");
    }

    #[test]
    fn api_key_only_enforced_on_supplied_header() {
        let mut headers = HeaderMap::new();
        assert!(check_api_key(Some("secret"), &headers).is_ok());

        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(check_api_key(Some("secret"), &headers).is_ok());
        assert!(check_api_key(None, &headers).is_ok());

        headers.insert("x-api-key", "wrong".parse().unwrap());
        let err = check_api_key(Some("secret"), &headers).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        let client = ClientMeta::from_headers(&headers);
        assert_eq!(client.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(client.user_agent.as_deref(), Some("curl/8.0"));
    }
}
