use crate::lm::ops::greedy;
use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use tokenizers::Tokenizer;

/// Turns token ids back into text
pub trait Detokenizer {
    fn decode_ids(&self, ids: &[u32]) -> Result<String>;
}

impl Detokenizer for Tokenizer {
    fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        self.decode(ids, false)
            .map_err(|e| Error::Msg(format!("Could not detokenize: {:?}", e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    /// Decoded text with newlines flattened to spaces
    pub text: String,
    /// Negative log-likelihood of the greedy path under the stored logits
    pub nll: f64,
    pub tokens: Vec<u32>,
}

impl Transcript {
    /// Reads the greedy path out of one sequence of stored logits `(steps, vocab_size)`.
    pub fn from_logits<T: Detokenizer + ?Sized>(
        logits: &Tensor,
        detokenizer: &T,
    ) -> Result<Self> {
        let logits = match logits.rank() {
            3 => logits.squeeze(0)?,
            _ => logits.clone(),
        };
        let logits = logits.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
        if logits.rank() != 2 {
            candle_core::bail!(
                "Transcript needs logits for one sequence, got shape {:?}; split batches first",
                logits.shape()
            );
        }

        let chosen = greedy(&logits)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        let logp = log_probs
            .gather(&chosen, D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .map(|&lp| lp as f64)
            .sum::<f64>();

        let tokens = chosen.flatten_all()?.to_vec1::<u32>()?;
        let text = detokenizer.decode_ids(&tokens)?.replace('\n', " ");
        Ok(Self {
            text,
            nll: -logp,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Letters by id, so the transcript is readable in assertions
    struct Letters;

    impl Detokenizer for Letters {
        fn decode_ids(&self, ids: &[u32]) -> Result<String> {
            ids.iter()
                .map(|&id| match id {
                    0 => Ok('\n'),
                    1..=26 => Ok((b'a' + id as u8 - 1) as char),
                    _ => candle_core::bail!("No letter for id {}", id),
                })
                .collect()
        }
    }

    #[test]
    fn test_greedy_path_and_nll() -> Result<()> {
        // Uniform over 4 except a spike on the chosen id
        let logits = Tensor::new(
            &[[0.0f32, 0.0, 0.0, 10.0], [0.0, 0.0, 0.0, 0.0], [2.0, 0.0, 1.0, 0.0]],
            &Device::Cpu,
        )?;
        let transcript = Transcript::from_logits(&logits, &Letters)?;
        assert_eq!(transcript.tokens, vec![3, 0, 0]);
        // Newline from id 0 is flattened
        assert_eq!(transcript.text, "c  ");

        let step0 = -(10f64 - (3.0 + 10f64.exp()).ln());
        let step1 = (4f64).ln();
        let step2 = -(2f64 - (2f64.exp() + 1.0 + 1f64.exp() + 1.0).ln());
        assert_abs_diff_eq!(transcript.nll, step0 + step1 + step2, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn test_reconstruction_is_idempotent() -> Result<()> {
        let logits = Tensor::new(
            &[[[0.3f32, 1.2, -0.7, 0.1, 2.2], [1.9, 0.0, 0.4, 0.5, -1.0]]],
            &Device::Cpu,
        )?;
        let first = Transcript::from_logits(&logits, &Letters)?;
        let second = Transcript::from_logits(&logits, &Letters)?;
        assert_eq!(first, second);
        assert_eq!(first.tokens, vec![4, 0]);
        Ok(())
    }

    #[test]
    fn test_rejects_batched_logits() {
        let logits = Tensor::zeros((2, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let err = Transcript::from_logits(&logits, &Letters).unwrap_err();
        assert!(err.to_string().contains("split batches first"));

        let flat = Tensor::zeros(5, DType::F32, &Device::Cpu).unwrap();
        assert!(Transcript::from_logits(&flat, &Letters).is_err());
    }
}
