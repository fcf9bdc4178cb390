//! The experiments the decoding loops exist for.
//!
//! Each takes a model and detokenizer by reference and returns plain reports;
//! printing is left to the caller.
use crate::config::{validate_temperature, CacheMode};
use crate::lm::{
    decode_blocking, ops::embed_inputs, ops::one_hot, DecodeMode, Detokenizer, LanguageModel,
    ModelInput, Transcript,
};
use candle_core::{DType, Error, Result, Tensor};

#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub temperature: f64,
    pub prompt_entropy: Option<f32>,
    pub transcript: Transcript,
}

/// How peaky the prompt is against how good the continuation is: soft-decode
/// from the one-hot prompt at each temperature. Lower temperature gives a
/// peakier prompt.
pub fn temperature_sweep<M, T>(
    model: &M,
    detokenizer: &T,
    prompt_ids: &Tensor,
    temperatures: &[f64],
    length: usize,
    cache_mode: CacheMode,
    show_progress: bool,
) -> Result<Vec<SweepEntry>>
where
    M: LanguageModel + ?Sized,
    T: Detokenizer + ?Sized,
{
    temperatures
        .iter()
        .map(|&temperature| {
            tracing::info!(temperature, "soft decoding");
            let mode = DecodeMode::one_hot(prompt_ids, model.vocab_size(), temperature)?;
            let out = decode_blocking(model, mode, length, cache_mode, show_progress)?;
            let transcript = Transcript::from_logits(&out.logits.get(0)?, detokenizer)?;
            Ok(SweepEntry {
                temperature,
                prompt_entropy: out.prompt_entropy,
                transcript,
            })
        })
        .collect()
}

/// Conventional greedy decoding: arg-max at every step.
pub fn argmax_baseline<M, T>(
    model: &M,
    detokenizer: &T,
    prompt_ids: &Tensor,
    length: usize,
    cache_mode: CacheMode,
    show_progress: bool,
) -> Result<Transcript>
where
    M: LanguageModel + ?Sized,
    T: Detokenizer + ?Sized,
{
    let mode = DecodeMode::ArgMax {
        prompt_ids: prompt_ids.clone(),
    };
    let out = decode_blocking(model, mode, length, cache_mode, show_progress)?;
    Transcript::from_logits(&out.logits.get(0)?, detokenizer)
}

#[derive(Debug, Clone, Copy)]
pub struct InputPathReport {
    /// Max |logit difference| of feeding looked-up embeddings vs ids
    pub lookup_max_diff: f32,
    /// Max |logit difference| of feeding the one-hot projection vs ids
    pub one_hot_max_diff: f32,
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()
}

/// Runs the same prompt through the model as ids, as looked-up embeddings and as
/// the projection of `one_hot / temperature`. The first two always agree; the
/// projection only converges on them as the temperature goes to zero.
pub fn compare_input_paths<M: LanguageModel + ?Sized>(
    model: &M,
    prompt_ids: &Tensor,
    temperature: f64,
) -> Result<InputPathReport> {
    let by_ids = model.forward(ModelInput::Ids(prompt_ids), None)?.logits;

    let looked_up = model.embed_ids(prompt_ids)?;
    let by_lookup = model.forward(ModelInput::Embeds(&looked_up), None)?.logits;

    let temperature =
        validate_temperature(temperature).map_err(|e| Error::Msg(e.to_string()))?;
    let scaled = (one_hot(prompt_ids, model.vocab_size(), DType::F32)? / temperature)?;
    let projected = embed_inputs(model.embeddings(), &scaled)?;
    let by_projection = model.forward(ModelInput::Embeds(&projected), None)?.logits;

    Ok(InputPathReport {
        lookup_max_diff: max_abs_diff(&by_ids, &by_lookup)?,
        one_hot_max_diff: max_abs_diff(&by_ids, &by_projection)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::toy::ToyLm;
    use candle_core::Device;

    struct Digits;

    impl Detokenizer for Digits {
        fn decode_ids(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| format!("<{}>", id)).collect())
        }
    }

    #[test]
    fn test_sweep_reports_every_temperature() -> Result<()> {
        let model = ToyLm::new(16, 8, 99, &Device::Cpu)?;
        let ids = Tensor::new(&[[2u32, 9, 4]], &Device::Cpu)?;
        let temperatures = [0.001, 0.3, 5.0];
        let entries =
            temperature_sweep(&model, &Digits, &ids, &temperatures, 6, CacheMode::Reuse, false)?;
        assert_eq!(entries.len(), 3);
        for (entry, &t) in entries.iter().zip(temperatures.iter()) {
            assert_eq!(entry.temperature, t);
            assert_eq!(entry.transcript.tokens.len(), 6);
            assert!(entry.prompt_entropy.is_some());
        }
        // Hotter prompts are flatter
        let h_cold = entries[0].prompt_entropy.unwrap_or_default();
        let h_hot = entries[2].prompt_entropy.unwrap_or_default();
        assert!(h_cold < h_hot);
        Ok(())
    }

    #[test]
    fn test_baseline_matches_cold_sweep() -> Result<()> {
        let model = ToyLm::new(16, 8, 5, &Device::Cpu)?;
        let ids = Tensor::new(&[[1u32, 7]], &Device::Cpu)?;
        let baseline = argmax_baseline(&model, &Digits, &ids, 8, CacheMode::Recompute, false)?;
        let sweep = temperature_sweep(&model, &Digits, &ids, &[1e-4], 8, CacheMode::Reuse, false)?;
        assert_eq!(baseline.tokens, sweep[0].transcript.tokens);
        assert_eq!(baseline.text, sweep[0].transcript.text);
        Ok(())
    }

    #[test]
    fn test_input_paths_agree_on_toy() -> Result<()> {
        let model = ToyLm::new(16, 8, 3, &Device::Cpu)?;
        let ids = Tensor::new(&[[0u32, 15, 8, 8]], &Device::Cpu)?;
        let report = compare_input_paths(&model, &ids, 0.001)?;
        assert!(report.lookup_max_diff < 1e-5);
        assert!(report.one_hot_max_diff < 1e-4);

        // Unscaled one-hot projection is a blurred embedding, not a lookup
        let report = compare_input_paths(&model, &ids, 1.0)?;
        assert!(report.one_hot_max_diff > 1e-3);
        Ok(())
    }
}
