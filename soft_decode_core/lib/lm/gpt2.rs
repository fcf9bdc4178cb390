use super::{KvCache, LanguageModel, ModelInput, ModelOutput};
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, ops::softmax_last_dim, Embedding, LayerNorm, Linear, VarBuilder,
};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

/// Subset of the Hugging Face `config.json` the forward pass needs
#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

impl Gpt2Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Could not open model config {:?}: {}", path.as_ref(), e)
        })?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        Ok(config)
    }

    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// GPT-2 checkpoints store `Conv1D` weights as (in, out); flip into a `Linear`.
fn conv1d(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    pub fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        let c_fc = conv1d(vb.pp("c_fc"), cfg.n_embd, 4 * cfg.n_embd)?;
        let c_proj = conv1d(vb.pp("c_proj"), 4 * cfg.n_embd, cfg.n_embd)?;
        Ok(Self { c_fc, c_proj })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // "gelu_new" is the tanh approximation
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

pub struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    dim: usize,
}

impl Attention {
    pub fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        // QKV for all heads, but in a batch
        let c_attn = conv1d(vb.pp("c_attn"), cfg.n_embd, 3 * cfg.n_embd)?;
        let c_proj = conv1d(vb.pp("c_proj"), cfg.n_embd, cfg.n_embd)?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
            dim: cfg.n_embd,
        })
    }

    /// Standard SDPA; masking is skipped for single-token steps
    fn scaled_dot_product_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let softmax_scale = 1f64 / (self.head_dim as f64).sqrt();
        let attn_weight = (query.matmul(&key.t()?)? * softmax_scale)?;
        let attn_weight = match attn_mask {
            None => attn_weight,
            Some(mask) => masked_fill(
                &attn_weight,
                &mask.broadcast_as(attn_weight.shape())?,
                f32::NEG_INFINITY,
            )?,
        };
        let attn_weight = softmax_last_dim(&attn_weight)?;
        attn_weight.matmul(&value.contiguous()?)
    }

    /// Returns the attention output and this layer's (keys, values) including history
    pub fn forward(
        &self,
        x: &Tensor,
        past: Option<&(Tensor, Tensor)>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (bsz, seqlen, _) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let split = |idx: usize| -> Result<Tensor> {
            qkv.narrow(D::Minus1, idx * self.dim, self.dim)?
                .reshape((bsz, seqlen, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let query_states = split(0)?;
        let key_states = split(1)?;
        let value_states = split(2)?;

        let (key_states, value_states) = match past {
            None => (key_states, value_states),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &key_states], 2)?,
                Tensor::cat(&[prev_v, &value_states], 2)?,
            ),
        };

        let y =
            self.scaled_dot_product_attention(&query_states, &key_states, &value_states, mask)?;
        let y = y.transpose(1, 2)?.reshape((bsz, seqlen, self.dim))?;
        Ok((self.c_proj.forward(&y)?, (key_states, value_states)))
    }
}

pub struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        let ln_1 = layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?;
        let attn = Attention::load(vb.pp("attn"), cfg)?;
        let ln_2 = layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?;
        let mlp = Mlp::load(vb.pp("mlp"), cfg)?;
        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        past: Option<&(Tensor, Tensor)>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let residual = x;
        let (attn_out, kv) = self.attn.forward(&self.ln_1.forward(x)?, past, mask)?;
        let x = (residual + attn_out)?;
        let residual = &x;
        let x = (residual + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok((x, kv))
    }
}

/// GPT-2 language-model head with tied input/output embeddings
pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    pub cfg: Gpt2Config,
    device: Device,
}

impl Gpt2 {
    pub fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        // Hub checkpoints come both with and without the `transformer.` prefix
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };
        let wte = embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?;
        let wpe = embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|l| Block::load(vb.pp(format!("h.{}", l)), cfg))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;
        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            cfg: cfg.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.wte.embeddings().dtype()
    }

    /// 1 is MASK, 0 is KEEP. `(seqlen, past_len + seqlen)`
    fn get_causal_mask(&self, seqlen: usize, past_len: usize) -> Result<Tensor> {
        let mask: Vec<u8> = (0..seqlen)
            .flat_map(|i| (0..past_len + seqlen).map(move |j| u8::from(j > past_len + i)))
            .collect();
        Tensor::from_slice(&mask, (seqlen, past_len + seqlen), &self.device)
    }
}

impl LanguageModel for Gpt2 {
    fn embeddings(&self) -> &Tensor {
        self.wte.embeddings()
    }

    fn vocab_size(&self) -> usize {
        self.cfg.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input: ModelInput<'_>, past: Option<KvCache>) -> Result<ModelOutput> {
        let inputs_embeds = match input {
            ModelInput::Ids(ids) => self.wte.forward(ids)?,
            ModelInput::Embeds(embeds) => embeds.to_dtype(self.dtype())?,
        };
        let (_, seqlen, _) = inputs_embeds.dims3()?;
        let past_len = match &past {
            Some(past) => past.seq_len()?,
            None => 0,
        };
        if past_len + seqlen > self.cfg.n_positions {
            candle_core::bail!(
                "Sequence of {} positions exceeds the model context of {}",
                past_len + seqlen,
                self.cfg.n_positions
            );
        }

        let positions = Tensor::arange(past_len as u32, (past_len + seqlen) as u32, &self.device)?;
        let mut x = inputs_embeds.broadcast_add(&self.wpe.forward(&positions)?)?;

        // Masking a single new token against its own history is redundant
        let mask = match seqlen {
            1 => None,
            _ => Some(self.get_causal_mask(seqlen, past_len)?),
        };

        let mut new_past = Vec::with_capacity(self.blocks.len());
        for (idx, block) in self.blocks.iter().enumerate() {
            let layer_past = past.as_ref().and_then(|p| p.layer(idx));
            let (out, kv) = block.forward(&x, layer_past, mask.as_ref())?;
            x = out;
            new_past.push(kv);
        }

        let x = self.ln_f.forward(&x)?;
        let logits = x.broadcast_matmul(&self.wte.embeddings().t()?)?;
        Ok(ModelOutput {
            logits,
            past: KvCache::new(new_past),
        })
    }
}
