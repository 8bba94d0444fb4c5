use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};

use crate::config::LogStoreSettings;

const MAX_PREVIEW_CHARS: usize = 200;
const MAX_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Uninitialized,
        }
    }
}

/// One served prediction, as recorded in the append-only log.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub text: String,
    pub label: String,
    pub confidence: f64,
    pub latency_ms: f64,
    pub model_version: String,
    pub cached: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Fire-and-forget analytics over Postgres. Writes are best effort and
/// never fail the serving path; reads return empty results when the
/// store is unreachable.
pub struct PredictionLog {
    settings: LogStoreSettings,
    pool: RwLock<Option<PgPool>>,
    state: AtomicU8,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelStats {
    pub count: i64,
    pub avg_confidence: f64,
    pub avg_latency_ms: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct StatsSummary {
    pub total_predictions: i64,
    pub num_labels: usize,
    pub window_hours: i32,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
pub struct StatsReport {
    pub labels: BTreeMap<String, LabelStats>,
    pub summary: StatsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct LowConfidenceRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub text_preview: String,
    pub predicted_label: String,
    pub confidence: f64,
    pub latency_ms: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelAccuracy {
    pub total_predictions: i64,
    pub avg_confidence: f64,
    pub high_confidence_pct: f64,
    pub low_confidence_pct: f64,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsHealth {
    pub status: &'static str,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_idle: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_predictions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionLog {
    pub fn new(settings: LogStoreSettings) -> Self {
        tracing::info!(
            host = %settings.host,
            database = %settings.database,
            "Prediction log initialized (not connected yet)"
        );
        Self {
            settings,
            pool: RwLock::new(None),
            state: AtomicU8::new(ConnState::Uninitialized as u8),
        }
    }

    /// Connect with the same retry/backoff/degrade shape as the cache
    /// layer, then idempotently ensure the schema exists.
    pub async fn connect(&self) -> bool {
        self.set_state(ConnState::Connecting);

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.try_connect().await {
                Ok(pool) => {
                    *self.pool.write().await = Some(pool);
                    self.set_state(ConnState::Connected);
                    tracing::info!("Prediction log connected");
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        max_attempts = MAX_CONNECT_ATTEMPTS,
                        error = %e,
                        "Prediction log connection failed"
                    );
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        let wait = std::time::Duration::from_secs(1 << attempt);
                        tracing::warn!(wait_secs = wait.as_secs(), "Retrying log store connection");
                        sleep(wait).await;
                    }
                }
            }
        }

        self.set_state(ConnState::Degraded);
        tracing::error!("Prediction log connection failed after all retries, continuing degraded");
        false
    }

    async fn try_connect(&self) -> anyhow::Result<PgPool> {
        let pool = PgPoolOptions::new()
            .min_connections(self.settings.pool_min)
            .max_connections(self.settings.pool_max)
            .acquire_timeout(self.settings.op_timeout)
            .connect(&self.settings.dsn())
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        self.ensure_schema(&pool).await?;

        Ok(pool)
    }

    async fn ensure_schema(&self, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                text_hash VARCHAR(64) NOT NULL,
                text_preview TEXT NOT NULL,
                predicted_label VARCHAR(50) NOT NULL,
                confidence DOUBLE PRECISION NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
                latency_ms DOUBLE PRECISION NOT NULL,
                ip_address INET,
                user_agent TEXT,
                model_version VARCHAR(50) NOT NULL DEFAULT 'unknown',
                cached BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_predictions_timestamp ON predictions(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_predictions_label ON predictions(predicted_label)",
            "CREATE INDEX IF NOT EXISTS idx_predictions_confidence ON predictions(confidence DESC)",
            "CREATE INDEX IF NOT EXISTS idx_predictions_text_hash ON predictions(text_hash)",
        ] {
            sqlx::query(statement).execute(pool).await?;
        }

        // Reserved for precomputed daily aggregates
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_stats_daily (
                date DATE PRIMARY KEY,
                total_predictions BIGINT,
                avg_confidence DOUBLE PRECISION,
                avg_latency_ms DOUBLE PRECISION,
                label_distribution JSONB
            )
            "#,
        )
        .execute(pool)
        .await?;

        tracing::info!("Analytics schema ensured");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    async fn pool(&self) -> Option<PgPool> {
        if !self.is_connected() {
            return None;
        }
        self.pool.read().await.clone()
    }

    /// Append one record. Always reports success-equivalent: a failed
    /// or timed-out insert is dropped, never retried, never surfaced.
    pub async fn log_prediction(&self, record: PredictionRecord) -> bool {
        let Some(pool) = self.pool().await else {
            tracing::debug!("Prediction log not connected - record skipped");
            return true;
        };

        let text_hash = hash_text(&record.text);
        let text_preview = preview(&record.text);

        let insert = sqlx::query(
            r#"
            INSERT INTO predictions
                (text_hash, text_preview, predicted_label, confidence, latency_ms,
                 ip_address, user_agent, model_version, cached)
            VALUES ($1, $2, $3, $4, $5, $6::inet, $7, $8, $9)
            "#,
        )
        .bind(&text_hash)
        .bind(text_preview)
        .bind(&record.label)
        .bind(record.confidence)
        .bind(record.latency_ms)
        .bind(record.ip_address.as_deref())
        .bind(record.user_agent.as_deref())
        .bind(&record.model_version)
        .bind(record.cached)
        .execute(&pool);

        match timeout(self.settings.op_timeout, insert).await {
            Ok(Ok(_)) => {
                tracing::debug!(
                    label = %record.label,
                    confidence = record.confidence,
                    latency_ms = record.latency_ms,
                    "Prediction logged"
                );
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to log prediction");
                true
            }
            Err(_) => {
                tracing::warn!("Prediction log insert timed out");
                true
            }
        }
    }

    /// Per-label aggregates over the trailing window. Empty report
    /// (not an error) when the store is unreachable.
    pub async fn get_stats(&self, window_hours: i32) -> StatsReport {
        let Some(pool) = self.pool().await else {
            tracing::warn!("Prediction log not connected - returning empty stats");
            return StatsReport::default();
        };

        let query = sqlx::query(
            r#"
            SELECT
                predicted_label,
                COUNT(*) AS count,
                AVG(confidence) AS avg_confidence,
                AVG(latency_ms) AS avg_latency,
                MIN(confidence) AS min_confidence,
                MAX(confidence) AS max_confidence,
                PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95_latency
            FROM predictions
            WHERE timestamp > NOW() - make_interval(hours => $1)
            GROUP BY predicted_label
            ORDER BY count DESC
            "#,
        )
        .bind(window_hours)
        .fetch_all(&pool);

        let rows = match timeout(self.settings.op_timeout, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to query stats");
                return StatsReport::default();
            }
            Err(_) => {
                tracing::warn!("Stats query timed out");
                return StatsReport::default();
            }
        };

        let mut labels = BTreeMap::new();
        let mut total = 0i64;
        for row in rows {
            let label: String = match row.try_get("predicted_label") {
                Ok(label) => label,
                Err(e) => {
                    tracing::error!(error = %e, "Malformed stats row");
                    continue;
                }
            };
            let count: i64 = row.try_get("count").unwrap_or_default();
            total += count;
            labels.insert(
                label,
                LabelStats {
                    count,
                    avg_confidence: optional_f64(&row, "avg_confidence"),
                    avg_latency_ms: optional_f64(&row, "avg_latency"),
                    min_confidence: optional_f64(&row, "min_confidence"),
                    max_confidence: optional_f64(&row, "max_confidence"),
                    p95_latency_ms: optional_f64(&row, "p95_latency"),
                },
            );
        }

        tracing::info!(total, window_hours, "Stats computed");
        StatsReport {
            summary: StatsSummary {
                total_predictions: total,
                num_labels: labels.len(),
                window_hours,
                generated_at: Some(Utc::now()),
            },
            labels,
        }
    }

    /// Recent predictions below the confidence threshold, newest first.
    pub async fn get_low_confidence(&self, threshold: f64, limit: i64) -> Vec<LowConfidenceRow> {
        let Some(pool) = self.pool().await else {
            return Vec::new();
        };

        let query = sqlx::query(
            r#"
            SELECT id, timestamp, text_preview, predicted_label, confidence, latency_ms, model_version
            FROM predictions
            WHERE confidence < $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(threshold)
        .bind(limit)
        .fetch_all(&pool);

        let rows = match timeout(self.settings.op_timeout, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to query low-confidence predictions");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!("Low-confidence query timed out");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| {
                Some(LowConfidenceRow {
                    id: row.try_get("id").ok()?,
                    timestamp: row.try_get("timestamp").ok()?,
                    text_preview: row.try_get("text_preview").ok()?,
                    predicted_label: row.try_get("predicted_label").ok()?,
                    confidence: row.try_get("confidence").ok()?,
                    latency_ms: row.try_get("latency_ms").ok()?,
                    model_version: row.try_get("model_version").ok()?,
                })
            })
            .collect()
    }

    /// Confidence-band breakdown per label over the trailing window.
    pub async fn get_label_accuracy(&self, window_hours: i32) -> BTreeMap<String, LabelAccuracy> {
        let Some(pool) = self.pool().await else {
            return BTreeMap::new();
        };

        let query = sqlx::query(
            r#"
            SELECT
                predicted_label,
                COUNT(*) AS total,
                AVG(confidence) AS avg_confidence,
                COUNT(*) FILTER (WHERE confidence > 0.8) AS high_confidence,
                COUNT(*) FILTER (WHERE confidence < 0.7) AS low_confidence
            FROM predictions
            WHERE timestamp > NOW() - make_interval(hours => $1)
            GROUP BY predicted_label
            ORDER BY total DESC
            "#,
        )
        .bind(window_hours)
        .fetch_all(&pool);

        let rows = match timeout(self.settings.op_timeout, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to query label accuracy");
                return BTreeMap::new();
            }
            Err(_) => {
                tracing::warn!("Label accuracy query timed out");
                return BTreeMap::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| {
                let label: String = row.try_get("predicted_label").ok()?;
                let total: i64 = row.try_get("total").ok()?;
                let high: i64 = row.try_get("high_confidence").unwrap_or_default();
                let low: i64 = row.try_get("low_confidence").unwrap_or_default();
                Some((
                    label,
                    LabelAccuracy {
                        total_predictions: total,
                        avg_confidence: optional_f64(&row, "avg_confidence"),
                        high_confidence_pct: pct(high, total),
                        low_confidence_pct: pct(low, total),
                    },
                ))
            })
            .collect()
    }

    pub async fn health_check(&self) -> AnalyticsHealth {
        let Some(pool) = self.pool().await else {
            return AnalyticsHealth {
                status: "disconnected",
                connected: false,
                pool_size: None,
                pool_idle: None,
                total_predictions: None,
                table_size_mb: None,
                error: None,
            };
        };

        let query = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM predictions) AS total_rows,
                pg_total_relation_size('predictions') AS table_size
            "#,
        )
        .fetch_one(&pool);

        match timeout(self.settings.op_timeout, query).await {
            Ok(Ok(row)) => AnalyticsHealth {
                status: "healthy",
                connected: true,
                pool_size: Some(pool.size()),
                pool_idle: Some(pool.num_idle()),
                total_predictions: row.try_get("total_rows").ok(),
                table_size_mb: row
                    .try_get::<i64, _>("table_size")
                    .ok()
                    .map(|bytes| bytes as f64 / 1024.0 / 1024.0),
                error: None,
            },
            Ok(Err(e)) => unhealthy(e.to_string()),
            Err(_) => unhealthy("health check timed out".to_string()),
        }
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        self.set_state(ConnState::Uninitialized);
        tracing::info!("Prediction log connection pool closed");
    }
}

fn unhealthy(error: String) -> AnalyticsHealth {
    AnalyticsHealth {
        status: "unhealthy",
        connected: false,
        pool_size: None,
        pool_idle: None,
        total_predictions: None,
        table_size_mb: None,
        error: Some(error),
    }
}

fn optional_f64(row: &sqlx::postgres::PgRow, column: &str) -> f64 {
    row.try_get::<Option<f64>, _>(column)
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn pct(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn hash_text(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// First 200 characters of the input, safe on multi-byte boundaries.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(MAX_PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn disconnected_log() -> PredictionLog {
        PredictionLog::new(LogStoreSettings {
            host: "localhost".to_string(),
            port: 5432,
            database: "topical".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            pool_min: 1,
            pool_max: 2,
            op_timeout: Duration::from_secs(5),
        })
    }

    fn sample_record() -> PredictionRecord {
        PredictionRecord {
            text: "Apple releases new iPhone".to_string(),
            label: "TECHNOLOGY".to_string(),
            confidence: 0.93,
            latency_ms: 41.5,
            model_version: "v1".to_string(),
            cached: false,
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn text_hash_is_full_sha256_hex() {
        let h = hash_text("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_text("hello"));
        assert_ne!(h, hash_text("hello "));
    }

    #[test]
    fn preview_truncates_at_200_chars() {
        let long = "é".repeat(300);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 200);

        let short = "short title";
        assert_eq!(preview(short), short);
    }

    #[test]
    fn pct_of_zero_total_is_zero() {
        assert_eq!(pct(5, 0), 0.0);
        assert_eq!(pct(1, 4), 25.0);
    }

    #[tokio::test]
    async fn degraded_log_reports_success() {
        let log = disconnected_log();
        assert!(log.log_prediction(sample_record()).await);
    }

    #[tokio::test]
    async fn degraded_stats_are_empty() {
        let log = disconnected_log();
        let report = log.get_stats(24).await;
        assert!(report.labels.is_empty());
        assert_eq!(report.summary.total_predictions, 0);
    }

    #[tokio::test]
    async fn degraded_queries_are_empty() {
        let log = disconnected_log();
        assert!(log.get_low_confidence(0.7, 100).await.is_empty());
        assert!(log.get_label_accuracy(24).await.is_empty());
    }

    #[tokio::test]
    async fn degraded_health_reports_disconnected() {
        let log = disconnected_log();
        let health = log.health_check().await;
        assert_eq!(health.status, "disconnected");
        assert!(!health.connected);
    }
}
