pub mod generate;
pub mod gpt2;
pub mod ops;
pub mod toy;
pub mod transcript;

pub use generate::{decode_blocking, DecodeMode, DecodeOutput, Decoder, SoftPrompt};
pub use gpt2::{Gpt2, Gpt2Config};
pub use transcript::{Detokenizer, Transcript};

use candle_core::{Device, Result, Tensor};

/// What a forward step consumes: discrete ids `(bsz, seqlen)` or dense
/// embeddings `(bsz, seqlen, dim)` standing in for an embedding lookup.
#[derive(Debug, Clone, Copy)]
pub enum ModelInput<'a> {
    Ids(&'a Tensor),
    Embeds(&'a Tensor),
}

/// Per-layer (keys, values), each `(bsz, n_head, seqlen, head_dim)`.
///
/// Opaque to callers: a forward step takes it by value and hands back its
/// replacement.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    layers: Vec<(Tensor, Tensor)>,
}

impl KvCache {
    pub fn new(layers: Vec<(Tensor, Tensor)>) -> Self {
        Self { layers }
    }

    pub fn layer(&self, idx: usize) -> Option<&(Tensor, Tensor)> {
        self.layers.get(idx)
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of positions already encoded
    pub fn seq_len(&self) -> Result<usize> {
        match self.layers.first() {
            Some((keys, _)) => keys.dim(2),
            None => Ok(0),
        }
    }
}

pub struct ModelOutput {
    /// `(bsz, seqlen, vocab_size)`
    pub logits: Tensor,
    pub past: KvCache,
}

/// The pretrained-model capability the decoding loops drive.
pub trait LanguageModel {
    /// Input embedding table, `(vocab_size, dim)`
    fn embeddings(&self) -> &Tensor;

    fn vocab_size(&self) -> usize;

    fn device(&self) -> &Device;

    fn forward(&self, input: ModelInput<'_>, past: Option<KvCache>) -> Result<ModelOutput>;

    /// Plain embedding lookup, the discrete counterpart of `ops::embed_inputs`
    fn embed_ids(&self, ids: &Tensor) -> Result<Tensor> {
        let (bsz, seqlen) = ids.dims2()?;
        let (_, dim) = self.embeddings().dims2()?;
        self.embeddings()
            .index_select(&ids.flatten_all()?, 0)?
            .reshape((bsz, seqlen, dim))
    }
}
