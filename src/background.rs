use metrics::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::analytics::{PredictionLog, PredictionRecord};
use crate::cache::PredictionCache;
use crate::types::CachedPrediction;

/// One deferred store write. Losing a job is an accepted degradation,
/// never a correctness problem: cache entries are recomputable and log
/// rows are best effort.
#[derive(Debug)]
pub enum WriteJob {
    StoreCacheEntry {
        text: String,
        value: CachedPrediction,
    },
    AppendLogRecord(PredictionRecord),
}

/// Front half of the fire-and-forget pipeline. Handlers submit jobs
/// without awaiting them; a full queue drops the new job instead of
/// applying backpressure to the response path.
#[derive(Clone)]
pub struct BackgroundWriter {
    job_tx: flume::Sender<WriteJob>,
}

impl BackgroundWriter {
    pub fn new(
        capacity: usize,
        cache: Arc<PredictionCache>,
        log: Arc<PredictionLog>,
        shutdown: CancellationToken,
    ) -> (Self, WriteWorker) {
        let (job_tx, job_rx) = flume::bounded(capacity.max(1));

        let worker = WriteWorker {
            job_rx,
            cache,
            log,
            shutdown,
        };

        (Self { job_tx }, worker)
    }

    /// Returns whether the job was accepted. Callers on the request
    /// path ignore the result; it exists for tests and metrics.
    pub fn submit(&self, job: WriteJob) -> bool {
        match self.job_tx.try_send(job) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                counter!("background_jobs_dropped_total").increment(1);
                tracing::warn!("Write queue full, dropping job");
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                tracing::warn!("Write worker gone, dropping job");
                false
            }
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.job_tx.len()
    }
}

pub struct WriteWorker {
    job_rx: flume::Receiver<WriteJob>,
    cache: Arc<PredictionCache>,
    log: Arc<PredictionLog>,
    shutdown: CancellationToken,
}

impl WriteWorker {
    /// Consume jobs until cancellation, then drain whatever is already
    /// queued. The drain is bounded by the queue capacity, so shutdown
    /// cannot hang on a backlog.
    #[tracing::instrument(skip(self))]
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let mut drained = 0usize;
                    while let Ok(job) = self.job_rx.try_recv() {
                        self.execute(job).await;
                        drained += 1;
                    }
                    tracing::info!(drained, "Write worker drained and stopped");
                    break;
                }
                job = self.job_rx.recv_async() => {
                    match job {
                        Ok(job) => self.execute(job).await,
                        Err(_) => {
                            tracing::info!("Write queue closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn execute(&self, job: WriteJob) {
        match job {
            WriteJob::StoreCacheEntry { text, value } => {
                self.cache.set(&text, &value).await;
            }
            WriteJob::AppendLogRecord(record) => {
                self.log.log_prediction(record).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, LogStoreSettings};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn disconnected_handles() -> (Arc<PredictionCache>, Arc<PredictionLog>) {
        let cache = Arc::new(PredictionCache::new(CacheSettings {
            url: "redis://localhost:6379".to_string(),
            ttl: Duration::from_secs(60),
            op_timeout: Duration::from_secs(5),
            max_in_flight: 2,
        }));
        let log = Arc::new(PredictionLog::new(LogStoreSettings {
            host: "localhost".to_string(),
            port: 5432,
            database: "topical".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            pool_min: 1,
            pool_max: 2,
            op_timeout: Duration::from_secs(5),
        }));
        (cache, log)
    }

    fn cache_job(text: &str) -> WriteJob {
        WriteJob::StoreCacheEntry {
            text: text.to_string(),
            value: CachedPrediction {
                label: "TECHNOLOGY".to_string(),
                confidence: 0.8,
                distribution: BTreeMap::from([("TECHNOLOGY".to_string(), 0.8)]),
            },
        }
    }

    #[tokio::test]
    async fn full_queue_drops_new_jobs() {
        let (cache, log) = disconnected_handles();
        let (writer, _worker) =
            BackgroundWriter::new(1, cache, log, CancellationToken::new());

        assert!(writer.submit(cache_job("first")));
        assert!(!writer.submit(cache_job("second")));
        assert_eq!(writer.queued(), 1);
    }

    #[tokio::test]
    async fn cancellation_drains_queued_jobs() {
        let (cache, log) = disconnected_handles();
        let shutdown = CancellationToken::new();
        let (writer, worker) = BackgroundWriter::new(8, cache, log, shutdown.clone());

        assert!(writer.submit(cache_job("a")));
        assert!(writer.submit(cache_job("b")));
        assert!(writer.submit(cache_job("c")));

        shutdown.cancel();
        worker.run().await;

        assert_eq!(writer.queued(), 0);
    }

    #[tokio::test]
    async fn worker_exits_when_writer_dropped() {
        let (cache, log) = disconnected_handles();
        let (writer, worker) =
            BackgroundWriter::new(8, cache, log, CancellationToken::new());

        let handle = tokio::spawn(worker.run());
        assert!(writer.submit(cache_job("a")));
        drop(writer);

        handle.await.unwrap();
    }
}
