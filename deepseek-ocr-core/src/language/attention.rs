//! Two attention variants selected per checkpoint: DeepSeek-V2's low-rank
//! multi-head latent attention with split NOPE/ROPE heads, and a plain
//! LLaMA-style fallback used when the checkpoint reports
//! `qk_nope_head_dim + qk_rope_head_dim == 0`. Grounded on `model.py`'s
//! nested `_OCRDeepseekV2Attention`/`_OCRLlamaAttention` classes, selected the
//! same way `_patch_decoder_attention` picks between them.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::LanguageConfig;
use crate::language::cache::KvCache;
use crate::layers::{causal_mask, RmsNorm, RotaryEmbedding, ScaledDotProductAttention, YarnScaling};

fn linear_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    candle_nn::linear_no_bias(in_dim, out_dim, vb)
}

/// DeepSeek-V2 multi-head latent attention: query and key/value are each
/// projected through a low-rank bottleneck, and only a slice of the head
/// dimension carries rotary position information.
#[derive(Debug)]
pub struct DeepseekAttention {
    q_a_proj: Option<Linear>,
    q_a_layernorm: Option<RmsNorm>,
    q_b_proj: Option<Linear>,
    q_proj: Option<Linear>,
    kv_a_proj_with_mqa: Linear,
    kv_a_layernorm: RmsNorm,
    kv_b_proj: Linear,
    o_proj: Linear,
    rotary: RotaryEmbedding,
    num_heads: usize,
    qk_nope_head_dim: usize,
    qk_rope_head_dim: usize,
    v_head_dim: usize,
    kv_lora_rank: usize,
    softmax_scale: f64,
}

impl DeepseekAttention {
    pub fn new(cfg: &LanguageConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let qk_nope_head_dim = cfg.qk_nope_head_dim;
        let qk_rope_head_dim = cfg.qk_rope_head_dim;
        let v_head_dim = cfg.v_head_dim;
        let q_head_dim = qk_nope_head_dim + qk_rope_head_dim;
        let kv_lora_rank = cfg.kv_lora_rank.unwrap_or(512);

        let (q_a_proj, q_a_layernorm, q_b_proj, q_proj) = if let Some(q_lora_rank) = cfg.q_lora_rank {
            (
                Some(linear_no_bias(cfg.hidden_size, q_lora_rank, vb.pp("q_a_proj"))?),
                Some(RmsNorm::new(q_lora_rank, cfg.rms_norm_eps, vb.pp("q_a_layernorm"))?),
                Some(linear_no_bias(q_lora_rank, num_heads * q_head_dim, vb.pp("q_b_proj"))?),
                None,
            )
        } else {
            (None, None, None, Some(linear_no_bias(cfg.hidden_size, num_heads * q_head_dim, vb.pp("q_proj"))?))
        };

        let kv_a_proj_with_mqa = linear_no_bias(
            cfg.hidden_size,
            kv_lora_rank + qk_rope_head_dim,
            vb.pp("kv_a_proj_with_mqa"),
        )?;
        let kv_a_layernorm = RmsNorm::new(kv_lora_rank, cfg.rms_norm_eps, vb.pp("kv_a_layernorm"))?;
        let kv_b_proj = linear_no_bias(
            kv_lora_rank,
            num_heads * (qk_nope_head_dim + v_head_dim),
            vb.pp("kv_b_proj"),
        )?;
        let o_proj = linear_no_bias(num_heads * v_head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        let yarn = cfg.rope_scaling.as_ref().map(|s| YarnScaling {
            factor: *s.get("factor").unwrap_or(&1.0),
            mscale_all_dim: *s.get("mscale_all_dim").unwrap_or(&0.0),
        });
        let rotary = RotaryEmbedding::new_yarn(
            cfg.rope_theta,
            qk_rope_head_dim,
            cfg.max_position_embeddings,
            vb.dtype(),
            vb.device(),
            yarn,
            cfg.rope_traditional,
        )?;

        let mscale = yarn
            .map(|y| if y.mscale_all_dim > 0.0 { 0.1 * y.mscale_all_dim * y.factor.max(1.0).ln() + 1.0 } else { 1.0 })
            .unwrap_or(1.0);
        let softmax_scale = (1.0 / (q_head_dim as f64).sqrt()) * mscale * mscale;

        Ok(Self {
            q_a_proj,
            q_a_layernorm,
            q_b_proj,
            q_proj,
            kv_a_proj_with_mqa,
            kv_a_layernorm,
            kv_b_proj,
            o_proj,
            rotary,
            num_heads,
            qk_nope_head_dim,
            qk_rope_head_dim,
            v_head_dim,
            kv_lora_rank,
            softmax_scale,
        })
    }

    pub fn forward(&self, x: &Tensor, layer: usize, cache: &mut KvCache) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        let q_head_dim = self.qk_nope_head_dim + self.qk_rope_head_dim;

        let q = if let (Some(a), Some(ln), Some(bp)) = (&self.q_a_proj, &self.q_a_layernorm, &self.q_b_proj) {
            bp.forward(&ln.forward(&a.forward(x)?)?)?
        } else {
            self.q_proj.as_ref().unwrap().forward(x)?
        };
        let q = q.reshape((b, s, self.num_heads, q_head_dim))?.transpose(1, 2)?.contiguous()?;
        let q_nope = q.narrow(3, 0, self.qk_nope_head_dim)?;
        let q_rope = q.narrow(3, self.qk_nope_head_dim, self.qk_rope_head_dim)?;

        let compressed_kv = self.kv_a_proj_with_mqa.forward(x)?;
        let kv_nope_dim = self.kv_lora_rank;
        let k_rope = compressed_kv.narrow(2, kv_nope_dim, self.qk_rope_head_dim)?;
        let kv_a = compressed_kv.narrow(2, 0, kv_nope_dim)?;
        let kv = self.kv_b_proj.forward(&self.kv_a_layernorm.forward(&kv_a)?)?;
        let kv = kv
            .reshape((b, s, self.num_heads, self.qk_nope_head_dim + self.v_head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k_nope = kv.narrow(3, 0, self.qk_nope_head_dim)?;
        let v = kv.narrow(3, self.qk_nope_head_dim, self.v_head_dim)?;

        // k_rope is shared across heads (MQA-style); broadcast it to every head
        // before concatenating with the per-head NOPE slice.
        let k_rope = k_rope.unsqueeze(1)?.broadcast_as((b, self.num_heads, s, self.qk_rope_head_dim))?.contiguous()?;

        let offset = cache.offset();
        let (q_rope, k_rope) = self.rotary.forward(&q_rope.contiguous()?, &k_rope, offset)?;

        let q = Tensor::cat(&[q_nope.contiguous()?, q_rope], 3)?;
        let k = Tensor::cat(&[k_nope.contiguous()?, k_rope], 3)?;

        let (k, v) = cache.append(layer, &k, &v)?;

        let mask = causal_mask(s, offset, x.dtype(), x.device())?;
        let attn = ScaledDotProductAttention;
        let out = attn.run_attention(&q, &k, &v, self.softmax_scale, mask.as_ref())?;
        let out = out.transpose(1, 2)?.reshape((b, s, self.num_heads * self.v_head_dim))?;
        self.o_proj.forward(&out)
    }
}

/// Plain LLaMA-style multi-head attention fallback, used for checkpoints that
/// report zero split-head dims (`_OCRLlamaAttention`).
#[derive(Debug)]
pub struct LlamaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl LlamaAttention {
    pub fn new(cfg: &LanguageConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let q_proj = linear_no_bias(cfg.hidden_size, cfg.num_attention_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(cfg.hidden_size, cfg.num_key_value_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(cfg.hidden_size, cfg.num_key_value_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(cfg.num_attention_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;
        // The LLaMA-style fallback always uses the rotate-half convention;
        // `rope_traditional` only governs the DeepSeek split-attention path.
        let rotary = RotaryEmbedding::new(cfg.rope_theta, head_dim, cfg.max_position_embeddings, vb.dtype(), vb.device(), false)?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, layer: usize, cache: &mut KvCache) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        let q = self.q_proj.forward(x)?.reshape((b, s, self.num_heads, self.head_dim))?.transpose(1, 2)?.contiguous()?;
        let k = self.k_proj.forward(x)?.reshape((b, s, self.num_kv_heads, self.head_dim))?.transpose(1, 2)?.contiguous()?;
        let v = self.v_proj.forward(x)?.reshape((b, s, self.num_kv_heads, self.head_dim))?.transpose(1, 2)?.contiguous()?;

        let offset = cache.offset();
        let (q, k) = self.rotary.forward(&q, &k, offset)?;

        let (k, v) = if self.num_kv_heads != self.num_heads {
            let repeat = self.num_heads / self.num_kv_heads;
            (repeat_kv(&k, repeat)?, repeat_kv(&v, repeat)?)
        } else {
            (k, v)
        };

        let (k, v) = cache.append(layer, &k, &v)?;

        let mask = causal_mask(s, offset, x.dtype(), x.device())?;
        let attn = ScaledDotProductAttention;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let out = attn.run_attention(&q, &k, &v, scale, mask.as_ref())?;
        let out = out.transpose(1, 2)?.reshape((b, s, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, h, s, d) = x.dims4()?;
    x.unsqueeze(2)?.broadcast_as((b, h, n_rep, s, d))?.reshape((b, h * n_rep, s, d))
}

/// Dispatches to whichever variant the checkpoint's head-dim fields select.
#[derive(Debug)]
pub enum Attention {
    Deepseek(DeepseekAttention),
    Llama(LlamaAttention),
}

impl Attention {
    pub fn new(cfg: &LanguageConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.uses_deepseek_split_attention() {
            Ok(Self::Deepseek(DeepseekAttention::new(cfg, vb)?))
        } else {
            Ok(Self::Llama(LlamaAttention::new(cfg, vb)?))
        }
    }

    pub fn forward(&self, x: &Tensor, layer: usize, cache: &mut KvCache) -> Result<Tensor> {
        match self {
            Self::Deepseek(a) => a.forward(x, layer, cache),
            Self::Llama(a) => a.forward(x, layer, cache),
        }
    }
}
