//! Small deterministic language model for exercising the decoding loops on CPU
//! without downloading weights.
//!
//! Each position's hidden state is its own embedding plus half the mean of the
//! embeddings seen so far; logits are the hidden state against the (tied)
//! embedding table.
use super::{KvCache, LanguageModel, ModelInput, ModelOutput};
use candle_core::{DType, Device, Result, Tensor};
use rand::{Rng, SeedableRng};

const CONTEXT_WEIGHT: f64 = 0.5;
const LOGIT_SCALE: f64 = 10.0;

pub struct ToyLm {
    embeddings: Tensor,
    vocab_size: usize,
    device: Device,
}

impl ToyLm {
    pub fn new(vocab_size: usize, dim: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..vocab_size * dim)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let embeddings = Tensor::from_vec(weights, (vocab_size, dim), device)?;
        Ok(Self {
            embeddings,
            vocab_size,
            device: device.clone(),
        })
    }

    /// `(n_new, n_total)` rows of a causal running-mean matrix for the last
    /// `n_new` positions
    fn running_mean_weights(&self, n_new: usize, n_total: usize) -> Result<Tensor> {
        let offset = n_total - n_new;
        let weights: Vec<f32> = (0..n_new)
            .flat_map(|i| {
                let pos = offset + i;
                (0..n_total).map(move |j| {
                    if j <= pos {
                        1.0 / (pos + 1) as f32
                    } else {
                        0.0
                    }
                })
            })
            .collect();
        Tensor::from_vec(weights, (n_new, n_total), &self.device)
    }
}

impl LanguageModel for ToyLm {
    fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input: ModelInput<'_>, past: Option<KvCache>) -> Result<ModelOutput> {
        let x = match input {
            ModelInput::Ids(ids) => self.embed_ids(ids)?,
            ModelInput::Embeds(embeds) => embeds.to_dtype(DType::F32)?,
        };
        let (_, seqlen, _) = x.dims3()?;

        // The single "layer" caches raw input embeddings as (bsz, 1, seqlen, dim)
        let x_cached = x.unsqueeze(1)?;
        let history = match past.as_ref().and_then(|p| p.layer(0)) {
            Some((prev, _)) => Tensor::cat(&[prev, &x_cached], 2)?,
            None => x_cached,
        };
        let n_total = history.dim(2)?;

        let context = self
            .running_mean_weights(seqlen, n_total)?
            .broadcast_matmul(&history.squeeze(1)?.contiguous()?)?;
        let hidden = (x + (context * CONTEXT_WEIGHT)?)?;
        let logits = (hidden.broadcast_matmul(&self.embeddings.t()?)? * LOGIT_SCALE)?;

        Ok(ModelOutput {
            logits,
            past: KvCache::new(vec![(history.clone(), history)]),
        })
    }
}
