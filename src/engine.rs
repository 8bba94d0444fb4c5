use crate::types::Prediction;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Engine {
    async fn predict(&self, text: String) -> Result<Prediction>;
}

/// Device-level inference over a whole batch of texts. The outer error
/// fails the batch as a unit; inner errors are per text.
#[async_trait]
pub trait BatchedEngine: Send + Sync {
    async fn predict_batch(&self, texts: Vec<String>) -> Result<Vec<Result<Prediction>>>;
}
