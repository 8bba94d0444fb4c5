use anyhow::Result;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval};

use crate::config::BatchConfig;
use crate::engine::{BatchedEngine, Engine};
use crate::types::Prediction;
use async_trait::async_trait;

type ResponseSender = oneshot::Sender<Result<Prediction>>;

#[derive(Debug)]
struct QueuedJob {
    text: String,
    response_tx: ResponseSender,
}

/// Front half of the inference batcher: single-text predictions are
/// queued through a rendezvous channel and coalesced into device
/// batches by the processor half.
pub struct BatchedClassifier {
    job_tx: flume::Sender<QueuedJob>,
}

impl BatchedClassifier {
    pub fn new<T: BatchedEngine + 'static>(
        config: BatchConfig,
        inner: T,
    ) -> (Self, BatchProcessor<T>) {
        let (job_tx, job_rx) = flume::bounded(0); // Rendezvous channel

        let processor = BatchProcessor {
            job_rx,
            config,
            queue: VecDeque::new(),
            inner,
        };

        (Self { job_tx }, processor)
    }
}

#[async_trait]
impl Engine for BatchedClassifier {
    #[tracing::instrument(skip(self, text), fields(text_chars = text.chars().count()))]
    async fn predict(&self, text: String) -> Result<Prediction> {
        let (response_tx, response_rx) = oneshot::channel();

        self.job_tx
            .send_async(QueuedJob { text, response_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Inference queue is closed"))?;

        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }
}

pub struct BatchProcessor<T: BatchedEngine> {
    job_rx: flume::Receiver<QueuedJob>,
    config: BatchConfig,
    queue: VecDeque<QueuedJob>,
    inner: T,
}

impl<T: BatchedEngine> BatchProcessor<T> {
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) -> Result<()> {
        let mut tick_timer = interval(self.config.tick_duration);

        loop {
            tokio::select! {
                job = self.job_rx.recv_async() => {
                    match job {
                        Ok(job) => {
                            self.queue.push_back(job);
                            tracing::debug!(queue_size = self.queue.len(), "Prediction queued");

                            if self.queue.len() >= self.config.batch_size {
                                tracing::debug!(batch_size = self.config.batch_size, "Batch size reached, processing immediately");
                                self.process_batch().await;
                            }
                        }
                        Err(_) => {
                            tracing::info!("Channel closed, processing remaining predictions and exiting");
                            if !self.queue.is_empty() {
                                self.process_batch().await;
                            }
                            break Ok(());
                        }
                    }
                }

                // Tick timer - flush pending predictions even if the batch isn't full
                _ = tick_timer.tick() => {
                    if !self.queue.is_empty() {
                        tracing::debug!(pending = self.queue.len(), "Tick timer fired, processing pending predictions");
                        self.process_batch().await;
                    } else {
                        tracing::trace!("Tick timer fired but no pending predictions");
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn process_batch(&mut self) {
        let batch_start = Instant::now();

        // Take up to batch_size jobs in FIFO order
        let batch: Vec<_> = self
            .queue
            .drain(..self.config.batch_size.min(self.queue.len()))
            .collect();

        if batch.is_empty() {
            return;
        }

        tracing::info!(batch_size = batch.len(), "Processing batch");

        let mut texts = Vec::with_capacity(batch.len());
        let mut response_channels = Vec::with_capacity(batch.len());
        for job in batch {
            texts.push(job.text);
            response_channels.push(job.response_tx);
        }

        match self.inner.predict_batch(texts).await {
            Ok(results) => {
                tracing::debug!(result_count = results.len(), "Batch inference successful");
                for (response_tx, result) in response_channels.into_iter().zip(results) {
                    let _ = response_tx.send(result);
                }
            }
            Err(err) => {
                tracing::error!("Batch inference failed: {}", err);
                for response_tx in response_channels {
                    let _ = response_tx.send(Err(anyhow::anyhow!("Batch inference failed: {err}")));
                }
            }
        }

        tracing::info!(
            processing_time_ms = batch_start.elapsed().as_millis(),
            "Batch processed"
        );
    }
}
