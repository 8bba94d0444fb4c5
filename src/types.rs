use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::{AnalyticsHealth, LabelAccuracy, LowConfidenceRow};
use crate::cache::CacheHealth;
use crate::evaluation::EvalMetrics;

/// Inputs longer than this are rejected before any downstream call.
pub const MAX_TEXT_CHARS: usize = 512;
pub const MAX_BATCH_TEXTS: usize = 100;
pub const MAX_EVAL_ITEMS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub text: String,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

/// A single classification outcome. `label` is the arg-max key of
/// `distribution` and `confidence` is its probability; the distribution
/// values are softmax outputs summing to ~1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    pub distribution: BTreeMap<String, f64>,
}

/// The subset of a prediction stored in the cache. Timing and the
/// `cached` flag are per-request and never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPrediction {
    pub label: String,
    pub confidence: f64,
    pub distribution: BTreeMap<String, f64>,
}

impl From<&Prediction> for CachedPrediction {
    fn from(p: &Prediction) -> Self {
        Self {
            label: p.label.clone(),
            confidence: p.confidence,
            distribution: p.distribution.clone(),
        }
    }
}

impl From<CachedPrediction> for Prediction {
    fn from(c: CachedPrediction) -> Self {
        Self {
            label: c.label,
            confidence: c.confidence,
            distribution: c.distribution,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub text: String,
    pub label: String,
    pub confidence: f64,
    pub distribution: BTreeMap<String, f64>,
    pub latency_ms: f64,
    pub cached: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPredictRequest {
    pub texts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchPredictResponse {
    pub id: String,
    pub count: usize,
    pub predictions: Vec<Prediction>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalItem {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub ground_truth: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalRequest {
    pub items: Vec<EvalItem>,
    #[serde(default = "default_true")]
    pub include_metrics: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalOutcome {
    pub id: String,
    pub text: String,
    pub label: String,
    pub confidence: f64,
    pub ground_truth: Option<String>,
    pub is_correct: Option<bool>,
    pub latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct EvalResponse {
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub predictions: Vec<EvalOutcome>,
    pub metrics: Option<EvalMetrics>,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FileEvalResponse {
    pub status: &'static str,
    pub output_file: String,
    pub batch: EvalResponse,
    pub preview: Vec<EvalOutcome>,
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub model_loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub model_loaded: bool,
    pub cache_connected: bool,
    pub analytics_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub timestamp: DateTime<Utc>,
    pub api: &'static str,
    pub model: ModelHealth,
    pub cache: CacheHealth,
    pub analytics: AnalyticsHealth,
}

#[derive(Debug, Serialize)]
pub struct ModelHealth {
    pub status: &'static str,
    pub classes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub model_name: String,
    pub model_version: String,
    pub num_classes: usize,
    pub classes: Vec<String>,
    pub features: FeatureFlags,
}

#[derive(Debug, Serialize)]
pub struct FeatureFlags {
    pub caching: bool,
    pub analytics: bool,
    pub batch_prediction: bool,
}

#[derive(Debug, Serialize)]
pub struct LowConfidenceResponse {
    pub threshold: f64,
    pub count: usize,
    pub predictions: Vec<LowConfidenceRow>,
}

#[derive(Debug, Serialize)]
pub struct LabelAccuracyResponse {
    pub window_hours: i32,
    pub labels: BTreeMap<String, LabelAccuracy>,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
