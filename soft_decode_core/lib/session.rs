use crate::config::RunConfig;
use crate::lm::{Gpt2, Gpt2Config, LanguageModel};
use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;
use std::path::PathBuf;
use std::time::Instant;
use tokenizers::Tokenizer;

struct CheckpointFiles {
    config: PathBuf,
    weights: PathBuf,
    tokenizer: PathBuf,
}

fn resolve_checkpoint(cfg: &RunConfig) -> anyhow::Result<CheckpointFiles> {
    match cfg.checkpoint.as_ref() {
        Some(dir) => {
            let dir = dir.canonicalize().with_context(|| {
                format!(
                    "Could not find checkpoint path {:?} relative to current directory",
                    dir
                )
            })?;
            Ok(CheckpointFiles {
                config: dir.join("config.json"),
                weights: dir.join("model.safetensors"),
                tokenizer: dir.join("tokenizer.json"),
            })
        }
        None => {
            let repo = Api::new()?.model(cfg.model_id.clone());
            Ok(CheckpointFiles {
                config: repo.get("config.json")?,
                weights: repo.get("model.safetensors")?,
                tokenizer: repo.get("tokenizer.json")?,
            })
        }
    }
}

/// A loaded model and tokenizer on one device, shared by every experiment in
/// a run. Dropping it releases the weights.
pub struct Session {
    pub model: Gpt2,
    pub tokenizer: Tokenizer,
    pub device: Device,
}

impl Session {
    pub fn load(cfg: &RunConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let device = cfg.device.device()?;
        let files = resolve_checkpoint(cfg)?;

        let start_load = Instant::now();
        let model_config = Gpt2Config::from_file(&files.config)?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        // Kept at F32 so soft inputs and discrete lookups see identical tables
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)?
        };
        let model = Gpt2::load(vb, &model_config)?;
        tracing::info!(
            model = %cfg.model_id,
            device = ?device,
            vocab_size = model.vocab_size(),
            "model loaded in {:.2}s",
            start_load.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// `(1, seqlen)` ids on the session device
    pub fn encode_prompt(&self, prompt: &str) -> anyhow::Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| anyhow::anyhow!("Could not tokenize: {:?}", e))?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            anyhow::bail!("Prompt {:?} encodes to no tokens", prompt);
        }
        Ok(Tensor::from_slice(ids, (1, ids.len()), &self.device)?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(device = ?self.device, "releasing model");
    }
}
