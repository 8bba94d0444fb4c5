use anyhow::{Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_nn::ops::softmax;
use candle_transformers::models::debertav2::{
    Config as DebertaV2Config, DebertaV2SeqClassificationModel, Id2Label,
};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokenizers::{PaddingParams, Tokenizer};

use crate::config::Config;
use crate::engine::BatchedEngine;
use crate::types::Prediction;

/// DeBERTa-v2 sequence classifier. Weights are read-only after load;
/// the struct is shared across all request tasks.
pub struct DebertaClassifier {
    model: DebertaV2SeqClassificationModel,
    tokenizer: Tokenizer,
    device: Device,
    id2label: Id2Label,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub device: String,
    pub max_sequence_length: usize,
    pub id2label: Option<HashMap<u32, String>>,
}

impl From<&Config> for ClassifierConfig {
    fn from(config: &Config) -> Self {
        Self {
            model_id: config.model_id.clone(),
            model_path: config.model_path.clone(),
            revision: config.model_revision.clone(),
            use_pth: config.use_pth,
            device: config.device.clone(),
            max_sequence_length: config.max_sequence_length,
            id2label: config.parse_id2label(),
        }
    }
}

impl DebertaClassifier {
    fn device(selector: &str) -> Result<Device> {
        match selector {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::new_cuda(0)?),
            "metal" => Ok(Device::new_metal(0)?),
            "auto" => {
                if metal_is_available() {
                    tracing::info!("Using metal acceleration");
                    Ok(Device::new_metal(0)?)
                } else if cuda_is_available() {
                    tracing::info!("Using CUDA GPU acceleration");
                    Ok(Device::new_cuda(0)?)
                } else {
                    tracing::info!(
                        "No accelerator available, running on CPU. To run on GPU, build with `--features cuda`"
                    );
                    Ok(Device::Cpu)
                }
            }
            other => bail!("unknown device selector {other:?} (expected auto, cpu, cuda or metal)"),
        }
    }

    async fn resolve_files(config: &ClassifierConfig) -> Result<(PathBuf, PathBuf, PathBuf)> {
        match &config.model_path {
            Some(base_path) => {
                if !base_path.is_dir() {
                    bail!("Model path {} is not a directory.", base_path.display());
                }

                let weights_file = if config.use_pth {
                    base_path.join("pytorch_model.bin")
                } else {
                    base_path.join("model.safetensors")
                };
                Ok((
                    base_path.join("config.json"),
                    base_path.join("tokenizer.json"),
                    weights_file,
                ))
            }
            None => {
                let Some(model_id) = config.model_id.clone() else {
                    bail!("Either model_id or model_path must be specified");
                };

                let repo = Repo::with_revision(model_id, RepoType::Model, config.revision.clone());
                let api = Api::new()?.repo(repo);
                let config_file = api.get("config.json").await?;
                let tokenizer_file = api.get("tokenizer.json").await?;
                let weights_file = if config.use_pth {
                    api.get("pytorch_model.bin").await?
                } else {
                    api.get("model.safetensors").await?
                };
                Ok((config_file, tokenizer_file, weights_file))
            }
        }
    }

    #[tracing::instrument(skip(config), fields(model_id = ?config.model_id, device = %config.device))]
    pub async fn new(config: ClassifierConfig) -> Result<Self> {
        let device = Self::device(&config.device)?;

        let (config_filename, tokenizer_filename, weights_filename) =
            Self::resolve_files(&config).await?;

        let model_config = std::fs::read_to_string(config_filename)?;
        let model_config: DebertaV2Config = serde_json::from_str(&model_config)?;

        // Command-line id2label takes precedence over the model config's.
        let id2label = if let Some(id2label) = config.id2label {
            id2label
        } else if let Some(id2label) = &model_config.id2label {
            id2label.clone()
        } else {
            bail!("Id2Label not found in the model configuration nor specified as a parameter");
        };

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: config.max_sequence_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;

        let vb = if config.use_pth {
            VarBuilder::from_pth(
                &weights_filename,
                candle_transformers::models::debertav2::DTYPE,
                &device,
            )?
        } else {
            unsafe {
                VarBuilder::from_mmaped_safetensors(
                    &[weights_filename],
                    candle_transformers::models::debertav2::DTYPE,
                    &device,
                )?
            }
        };

        let vb = vb.set_prefix("deberta");
        let model =
            DebertaV2SeqClassificationModel::load(vb, &model_config, Some(id2label.clone()))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            id2label,
        })
    }

    /// Class labels ordered by class id.
    pub fn classes(&self) -> Vec<String> {
        let mut pairs: Vec<(&u32, &String)> = self.id2label.iter().collect();
        pairs.sort_by_key(|(id, _)| **id);
        pairs.into_iter().map(|(_, label)| label.clone()).collect()
    }

    fn label_for(&self, class_id: u32) -> String {
        self.id2label
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{class_id}"))
    }
}

#[async_trait]
impl BatchedEngine for DebertaClassifier {
    #[tracing::instrument(skip(self, texts), fields(batch_size = texts.len()))]
    async fn predict_batch(&self, texts: Vec<String>) -> Result<Vec<Result<Prediction>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Tokenize the whole batch off the async runtime
        let tokenizer = self.tokenizer.clone();
        let (input_ids, attention_mask, token_type_ids) = tokio::task::spawn_blocking(move || {
            tokenizer
                .encode_batch(texts, true)
                .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))
                .map(|encodings| {
                    let mut id_stack = Vec::with_capacity(encodings.len());
                    let mut mask_stack = Vec::with_capacity(encodings.len());
                    let mut type_stack = Vec::with_capacity(encodings.len());

                    for encoding in &encodings {
                        id_stack.push(encoding.get_ids().to_vec());
                        mask_stack.push(encoding.get_attention_mask().to_vec());
                        type_stack.push(encoding.get_type_ids().to_vec());
                    }

                    (id_stack, mask_stack, type_stack)
                })
        })
        .await??;

        let input_ids_tensors: Result<Vec<_>> = input_ids
            .iter()
            .map(|ids| Tensor::new(ids.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();
        let attention_mask_tensors: Result<Vec<_>> = attention_mask
            .iter()
            .map(|mask| Tensor::new(mask.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();
        let token_type_ids_tensors: Result<Vec<_>> = token_type_ids
            .iter()
            .map(|types| Tensor::new(types.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();

        let input_ids = Tensor::stack(&input_ids_tensors?, 0)?;
        let attention_mask = Tensor::stack(&attention_mask_tensors?, 0)?;
        let token_type_ids = Tensor::stack(&token_type_ids_tensors?, 0)?;

        let logits = self
            .model
            .forward(&input_ids, Some(token_type_ids), Some(attention_mask))?;
        let top_classes = logits.argmax(1)?.to_vec1::<u32>()?;
        let scores = softmax(&logits, 1)?.to_vec2::<f32>()?;

        let predictions = top_classes
            .iter()
            .zip(scores.iter())
            .map(|(&class_id, probs)| {
                let distribution: BTreeMap<String, f64> = probs
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| (self.label_for(i as u32), p as f64))
                    .collect();
                let label = self.label_for(class_id);
                let confidence = probs
                    .get(class_id as usize)
                    .copied()
                    .unwrap_or_default() as f64;

                Ok(Prediction {
                    label,
                    confidence,
                    distribution,
                })
            })
            .collect();

        Ok(predictions)
    }
}
