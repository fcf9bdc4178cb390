use candle_core::{bail, DType, Result, Tensor, D};
use candle_nn::ops::{log_softmax, softmax_last_dim};

/// Softmax over the vocab axis, always in F32
pub fn vocab_probs(logits: &Tensor) -> Result<Tensor> {
    softmax_last_dim(&logits.to_dtype(DType::F32)?.contiguous()?)
}

/// Expected embedding under `softmax(logits)`.
///
/// Typically the model embeds a one-hot vector; here the softmax forces each
/// row to sum to one so it behaves like a smoothed one-hot, and the matmul with
/// the table is the probability-weighted sum of its rows.
///
/// `logits` is `(..., vocab_size)`, `embeddings` is `(vocab_size, dim)`.
/// Returns `(..., dim)` on the table's device and dtype.
pub fn embed_inputs(embeddings: &Tensor, logits: &Tensor) -> Result<Tensor> {
    let (vocab_size, _) = embeddings.dims2()?;
    let n_logits = logits.dim(D::Minus1)?;
    if n_logits != vocab_size {
        bail!(
            "Cannot project {} logits onto an embedding table of {} rows",
            n_logits,
            vocab_size
        );
    }
    let probs = vocab_probs(logits)?
        .to_device(embeddings.device())?
        .to_dtype(embeddings.dtype())?;
    probs.broadcast_matmul(embeddings)
}

/// Shannon entropy of `softmax(logits)` summed over every leading position.
///
/// Uses `log_softmax` so underflowed probabilities count as zero rather than NaN.
pub fn entropy(logits: &Tensor) -> Result<f32> {
    let logits = logits.to_dtype(DType::F32)?.contiguous()?;
    let probs = softmax_last_dim(&logits)?;
    let log_probs = log_softmax(&logits, D::Minus1)?;
    (probs * log_probs)?
        .sum_all()?
        .neg()?
        .to_scalar::<f32>()
}

/// Top-1 index over the last axis, keeping it with size 1.
pub fn greedy(logits: &Tensor) -> Result<Tensor> {
    logits.argmax_keepdim(D::Minus1)
}

/// One-hot encodes `ids`, appending a `vocab_size` axis.
///
/// Scalars and vectors are first given leading unit axes until they are at
/// least `(bsz, seqlen)`.
pub fn one_hot(ids: &Tensor, vocab_size: usize, dtype: DType) -> Result<Tensor> {
    let mut ids = ids.to_dtype(DType::U32)?;
    while ids.rank() < 2 {
        ids = ids.unsqueeze(0)?;
    }
    let mut dims = ids.dims().to_vec();
    let flat = ids.flatten_all()?.to_device(&candle_core::Device::Cpu)?.to_vec1::<u32>()?;

    let mut data = vec![0u8; flat.len() * vocab_size];
    for (pos, &id) in flat.iter().enumerate() {
        if id as usize >= vocab_size {
            bail!("Token id {} is out of range for vocab size {}", id, vocab_size);
        }
        data[pos * vocab_size + id as usize] = 1;
    }
    dims.push(vocab_size);
    Tensor::from_vec(data, dims, ids.device())?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_one_hot_scenario() -> Result<()> {
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
        let encoded = one_hot(&ids, 5, DType::U32)?;
        assert_eq!(encoded.dims(), &[1, 3, 5]);
        let rows = encoded.to_vec3::<u32>()?;
        assert_eq!(
            rows[0],
            vec![
                vec![0, 1, 0, 0, 0],
                vec![0, 0, 1, 0, 0],
                vec![0, 0, 0, 1, 0]
            ]
        );
        Ok(())
    }

    #[test]
    fn test_one_hot_exactly_one_per_position() -> Result<()> {
        let ids = Tensor::new(&[[4u32, 0], [2, 2], [7, 1]], &Device::Cpu)?;
        let encoded = one_hot(&ids, 8, DType::F32)?;
        assert_eq!(encoded.dims(), &[3, 2, 8]);
        let per_position = encoded.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(per_position.iter().all(|&s| s == 1.0));
        let picked = encoded.argmax(D::Minus1)?.to_vec2::<u32>()?;
        assert_eq!(picked, vec![vec![4, 0], vec![2, 2], vec![7, 1]]);
        Ok(())
    }

    #[test]
    fn test_one_hot_promotes_rank() -> Result<()> {
        let ids = Tensor::new(&[3u32, 0], &Device::Cpu)?;
        assert_eq!(one_hot(&ids, 4, DType::F32)?.dims(), &[1, 2, 4]);
        let id = Tensor::new(2u32, &Device::Cpu)?;
        assert_eq!(one_hot(&id, 4, DType::F32)?.dims(), &[1, 1, 4]);
        Ok(())
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let ids = Tensor::new(&[[0u32, 5]], &Device::Cpu).unwrap();
        assert!(one_hot(&ids, 5, DType::F32).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() -> Result<()> {
        let logits = Tensor::new(
            &[[[3.0f32, -1.0, 0.5, 12.0], [-40.0, 0.0, 0.0, 1e-3]]],
            &Device::Cpu,
        )?;
        for row in vocab_probs(&logits)?.squeeze(0)?.to_vec2::<f32>()? {
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_embed_one_hot_is_lookup() -> Result<()> {
        let device = Device::Cpu;
        let table = Tensor::new(
            &[[1.0f32, 0.0], [0.0, 1.0], [2.0, -3.0], [0.5, 0.5]],
            &device,
        )?;
        let ids = Tensor::new(&[[2u32, 0]], &device)?;
        // Scaled so the softmax is numerically one-hot
        let scaled = (one_hot(&ids, 4, DType::F32)? / 0.001)?;
        let embeds = embed_inputs(&table, &scaled)?;
        assert_eq!(embeds.dims(), &[1, 2, 2]);
        let embeds = embeds.squeeze(0)?.to_vec2::<f32>()?;
        assert_abs_diff_eq!(embeds[0][0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(embeds[0][1], -3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(embeds[1][0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(embeds[1][1], 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_embed_uniform_is_mean_row() -> Result<()> {
        let device = Device::Cpu;
        let table = Tensor::new(&[[1.0f32, 4.0], [3.0, 0.0]], &device)?;
        let logits = Tensor::zeros((1, 1, 2), DType::F32, &device)?;
        let embeds = embed_inputs(&table, &logits)?.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(embeds[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(embeds[1], 2.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_embed_shape_mismatch() {
        let device = Device::Cpu;
        let table = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let logits = Tensor::zeros((1, 1, 3), DType::F32, &device).unwrap();
        assert!(embed_inputs(&table, &logits).is_err());
    }

    #[test]
    fn test_entropy_bounds() -> Result<()> {
        let device = Device::Cpu;
        let uniform = Tensor::zeros((1, 1, 16), DType::F32, &device)?;
        assert_abs_diff_eq!(entropy(&uniform)?, (16f32).ln(), epsilon = 1e-5);

        let ids = Tensor::new(&[[3u32]], &device)?;
        let peaked = (one_hot(&ids, 16, DType::F32)? / 0.001)?;
        let h = entropy(&peaked)?;
        assert!(h.is_finite());
        assert_abs_diff_eq!(h, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_greedy_keeps_axis() -> Result<()> {
        let logits = Tensor::new(&[[0.1f32, 2.0, -1.0], [5.0, 4.0, 4.5]], &Device::Cpu)?;
        let top = greedy(&logits)?;
        assert_eq!(top.dims(), &[2, 1]);
        assert_eq!(top.to_vec2::<u32>()?, vec![vec![1], vec![0]]);
        Ok(())
    }
}
