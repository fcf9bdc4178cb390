use crate::config::{validate_temperature, CacheMode};
use crate::lm::ops::{embed_inputs, entropy, greedy, one_hot};
use crate::lm::{KvCache, LanguageModel, ModelInput};
use candle_core::{DType, Error, Result, Tensor, D};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Initial input for embedding-weighted decoding
#[derive(Debug, Clone)]
pub enum SoftPrompt {
    /// `(bsz, seqlen, vocab_size)` one-hot or logits; divided by the temperature
    /// and projected through the embedding table
    Distribution(Tensor),
    /// `(bsz, seqlen, dim)` fed to the model as-is
    Embedding(Tensor),
}

/// How each step's input is produced. Everything else about the loop is shared.
#[derive(Debug, Clone)]
pub enum DecodeMode {
    /// Feed back the expected embedding under `softmax(logits / temperature)`
    Soft {
        prompt: SoftPrompt,
        temperature: f64,
    },
    /// Feed back the top-1 token id
    ArgMax { prompt_ids: Tensor },
}

impl DecodeMode {
    /// Soft decoding primed with the one-hot encoding of `prompt_ids`
    pub fn one_hot(prompt_ids: &Tensor, vocab_size: usize, temperature: f64) -> Result<Self> {
        Ok(Self::Soft {
            prompt: SoftPrompt::Distribution(one_hot(prompt_ids, vocab_size, DType::F32)?),
            temperature,
        })
    }
}

enum StepInput {
    Embeds(Tensor),
    Ids(Tensor),
}

/// Yields the last-position logits `(bsz, 1, vocab_size)` of each step, for
/// exactly `length` steps.
pub struct Decoder<'a, M: LanguageModel + ?Sized> {
    model: &'a M,
    /// Set in soft mode only
    temperature: Option<f64>,
    cache_mode: CacheMode,
    past: Option<KvCache>,
    /// What the next forward pass consumes: only the newest step when reusing
    /// the cache, the whole sequence otherwise
    pending: StepInput,
    pub steps_taken: usize,
    length: usize,
    /// Entropy of the temperature-scaled prompt distribution, if there was one
    pub prompt_entropy: Option<f32>,
}

impl<'a, M: LanguageModel + ?Sized> Decoder<'a, M> {
    pub fn new(
        model: &'a M,
        mode: DecodeMode,
        length: usize,
        cache_mode: CacheMode,
    ) -> Result<Self> {
        if length == 0 {
            candle_core::bail!("Decoding length must be at least one step");
        }
        let device = model.device();
        let table = model.embeddings();

        let (temperature, pending, prompt_entropy) = match mode {
            DecodeMode::Soft {
                prompt,
                temperature,
            } => {
                let temperature =
                    validate_temperature(temperature).map_err(|e| Error::Msg(e.to_string()))?;
                match prompt {
                    SoftPrompt::Distribution(dist) => {
                        let dist = match dist.rank() {
                            2 => dist.unsqueeze(0)?,
                            _ => dist,
                        };
                        let scaled = (dist.to_dtype(DType::F32)? / temperature)?;
                        let h = entropy(&scaled)?;
                        tracing::info!(entropy = h, temperature, "prompt distribution");
                        let embeds = embed_inputs(table, &scaled)?;
                        (Some(temperature), StepInput::Embeds(embeds), Some(h))
                    }
                    SoftPrompt::Embedding(embeds) => {
                        let embeds = match embeds.rank() {
                            2 => embeds.unsqueeze(0)?,
                            _ => embeds,
                        };
                        let embeds = embeds.to_device(device)?.to_dtype(table.dtype())?;
                        (Some(temperature), StepInput::Embeds(embeds), None)
                    }
                }
            }
            DecodeMode::ArgMax { prompt_ids } => {
                let ids = match prompt_ids.rank() {
                    1 => prompt_ids.unsqueeze(0)?,
                    _ => prompt_ids,
                };
                let ids = ids.to_dtype(DType::U32)?.to_device(device)?;
                (None, StepInput::Ids(ids), None)
            }
        };

        Ok(Self {
            model,
            temperature,
            cache_mode,
            past: None,
            pending,
            steps_taken: 0,
            length,
            prompt_entropy,
        })
    }

    fn step(&mut self) -> Result<Tensor> {
        let input = match &self.pending {
            StepInput::Embeds(embeds) => ModelInput::Embeds(embeds),
            StepInput::Ids(ids) => ModelInput::Ids(ids),
        };
        let past = match self.cache_mode {
            CacheMode::Reuse => self.past.take(),
            CacheMode::Recompute => None,
        };
        let output = self.model.forward(input, past)?;

        let seqlen = output.logits.dim(1)?;
        let logits = output.logits.narrow(1, seqlen - 1, 1)?;
        let logits = match self.temperature {
            Some(temperature) => (logits / temperature)?,
            None => logits,
        };

        // Re-embed without further temperature scaling, or take the top-1 token
        let next = match self.temperature {
            Some(_) => embed_inputs(self.model.embeddings(), &logits)?,
            None => greedy(&logits)?.squeeze(D::Minus1)?,
        };
        self.pending = match (self.cache_mode, &self.pending) {
            (CacheMode::Reuse, StepInput::Embeds(_)) => StepInput::Embeds(next),
            (CacheMode::Reuse, StepInput::Ids(_)) => StepInput::Ids(next),
            (CacheMode::Recompute, StepInput::Embeds(prev)) => {
                StepInput::Embeds(Tensor::cat(&[prev, &next], 1)?)
            }
            (CacheMode::Recompute, StepInput::Ids(prev)) => {
                StepInput::Ids(Tensor::cat(&[prev, &next], 1)?)
            }
        };
        if self.cache_mode == CacheMode::Reuse {
            self.past = Some(output.past);
        }

        self.steps_taken += 1;
        Ok(logits)
    }
}

impl<M: LanguageModel + ?Sized> Iterator for Decoder<'_, M> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Result<Tensor>> {
        if self.steps_taken >= self.length {
            return None;
        }
        let result = self.step();
        if result.is_err() {
            // Nothing sensible to continue from
            self.steps_taken = self.length;
        }
        Some(result)
    }
}

pub struct DecodeOutput {
    /// `(bsz, length, vocab_size)`; divided by the temperature in soft mode
    pub logits: Tensor,
    pub prompt_entropy: Option<f32>,
}

pub fn decode_blocking<M: LanguageModel + ?Sized>(
    model: &M,
    mode: DecodeMode,
    length: usize,
    cache_mode: CacheMode,
    show_progress: bool,
) -> Result<DecodeOutput> {
    let mut decoder = Decoder::new(model, mode, length, cache_mode)?;

    let spinner = if show_progress {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} [{elapsed_precise}] {per_sec} iterations/s")
                .map_err(|e| Error::Msg(format!("Bad progress template: {}", e)))?
                .tick_chars("/|\\- "),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    } else {
        None
    };

    let start_decode = Instant::now();
    let mut steps: Vec<Tensor> = Vec::with_capacity(length);
    for (i, maybe_logits) in decoder.by_ref().enumerate() {
        steps.push(maybe_logits?);
        if let Some(spinner) = &spinner {
            spinner.inc(1);
            spinner.set_message(format!("Steps: {}", i + 1));
        }
    }
    let dt = start_decode.elapsed();
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    tracing::debug!(
        steps = steps.len(),
        ?cache_mode,
        "decoded in {:.3}s ({:.3}ms / step)",
        dt.as_secs_f64(),
        dt.as_secs_f64() * 1e3 / steps.len() as f64
    );

    Ok(DecodeOutput {
        logits: Tensor::cat(&steps, 1)?,
        prompt_entropy: decoder.prompt_entropy,
    })
}
