//! DeepSeek-V2 decoder stack: per-layer RMSNorm + attention + feed-forward
//! residual blocks, an embedding table, and a final norm. Grounded on the
//! existing Rust DeepSeek-OCR language-model port's `TransformerDecoder`
//! structure, generalized to this crate's config and KV cache.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use crate::config::LanguageConfig;
use crate::language::attention::Attention;
use crate::language::cache::KvCache;
use crate::language::mlp::FeedForward;
use crate::layers::RmsNorm;

#[derive(Debug)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: FeedForward,
}

impl DecoderLayer {
    fn new(cfg: &LanguageConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("post_attention_layernorm"))?,
            mlp: FeedForward::new(cfg, layer_idx, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, layer_idx: usize, cache: &mut KvCache) -> Result<Tensor> {
        let residual = x.clone();
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, layer_idx, cache)?;
        let x = (residual + h)?;

        let residual = x.clone();
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        residual + h
    }
}

/// The decoder stack proper: token embedding lookup happens separately (see
/// `gather_embeddings` in `model.rs`) since multimodal inputs replace some
/// embedding rows before the first layer runs.
#[derive(Debug)]
pub struct TransformerDecoder {
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
}

impl TransformerDecoder {
    pub fn new(cfg: &LanguageConfig, vb: VarBuilder) -> Result<Self> {
        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(cfg, i, vb_layers.pp(i))?);
        }
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self { layers, norm })
    }

    pub fn forward(&self, embeds: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let seq_len = embeds.dim(1)?;
        let mut x = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, i, cache)?;
        }
        cache.advance(seq_len);
        self.norm.forward(&x)
    }
}

pub fn embed_tokens(embedding: &Embedding, ids: &Tensor) -> Result<Tensor> {
    embedding.forward(ids)
}
