//! Shared tensor-runtime primitives used by both the vision and language stacks:
//! RMSNorm, rotary embeddings, and a scaled dot-product attention dispatcher.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{Module, VarBuilder};

/// RMSNorm wrapping `candle_nn`'s fused kernel, matching every norm in the decoder
/// and the CLIP/SAM backbones' LayerNorms aside (those use plain `candle_nn::LayerNorm`).
#[derive(Debug, Clone)]
pub struct RmsNorm {
    eps: f64,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let inner = candle_nn::rms_norm_non_quant(size, eps, vb)?;
        let weight = inner.inner().weight().clone();
        Ok(Self { eps, weight })
    }

    pub fn from_weight(weight: Tensor, eps: f64) -> Self {
        Self { eps, weight }
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&x.contiguous()?, &self.weight, self.eps as f32)
    }
}

/// Plain rotary position embedding, optionally YARN-rescaled. Used by the
/// split NOPE/ROPE DeepSeek-V2 attention as well as the LLaMA-style fallback.
///
/// Unlike `candle_nn::RotaryEmbedding` this caches a (seq, dim) sin/cos table
/// and narrows it per request instead of recomputing per-call, mirroring the
/// cache shape the decoder's KV cache offset indexes into.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    traditional: bool,
}

/// YARN-style scaling parameters used to both rescale the inverse frequencies
/// and the attention temperature (`mscale`), mirroring `rope_scaling` in the
/// DeepSeek-V2 checkpoint's `config.json`.
#[derive(Debug, Clone, Copy)]
pub struct YarnScaling {
    pub factor: f64,
    pub mscale_all_dim: f64,
}

impl RotaryEmbedding {
    pub fn new(
        base: f64,
        dim: usize,
        max_position_embeddings: usize,
        dtype: DType,
        dev: &Device,
        traditional: bool,
    ) -> Result<Self> {
        Self::new_yarn(base, dim, max_position_embeddings, dtype, dev, None, traditional)
    }

    pub fn new_yarn(
        base: f64,
        dim: usize,
        max_position_embeddings: usize,
        dtype: DType,
        dev: &Device,
        yarn: Option<YarnScaling>,
        traditional: bool,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / base.powf(i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_position_embeddings as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((max_position_embeddings, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let mscale = yarn
            .map(|y| {
                if y.mscale_all_dim > 0.0 {
                    0.1 * y.mscale_all_dim * y.factor.max(1.0).ln() + 1.0
                } else {
                    1.0
                }
            })
            .unwrap_or(1.0);
        let cos = (freqs.cos()? * mscale)?.to_dtype(dtype)?;
        let sin = (freqs.sin()? * mscale)?.to_dtype(dtype)?;
        Ok(Self { cos, sin, traditional })
    }

    /// Applies rotary embedding, returning new (q, k). `offset` is the KV
    /// cache's current length; `q`/`k` are `(b, h, seq, dim)`.
    ///
    /// Two rotation conventions exist and are not interchangeable: the
    /// "non-traditional" rotate-half convention (`rope`, pairs an element
    /// with its partner `dim/2` positions away) and MLX's "traditional"
    /// convention (`rope_i`, pairs adjacent elements `(x[2i], x[2i+1])`).
    /// `config.rope_traditional` selects which one a checkpoint expects.
    pub fn forward(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let (q_embed, k_embed) = if self.traditional {
            (
                candle_nn::rotary_emb::rope_i(&q.contiguous()?, &cos, &sin)?,
                candle_nn::rotary_emb::rope_i(&k.contiguous()?, &cos, &sin)?,
            )
        } else {
            (
                candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?,
                candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?,
            )
        };
        Ok((q_embed, k_embed))
    }
}

/// Computes `softmax(QK^T / sqrt(d_k) + mask) @ V`.
///
/// There is a single naive (matmul + softmax) path: the teacher's flash-attn /
/// cuBLASLt dispatch exists for multi-GPU server throughput, which this
/// single-request engine does not need.
pub struct ScaledDotProductAttention;

impl ScaledDotProductAttention {
    pub fn run_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        scale: f64,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let att = (q.contiguous()?.matmul(&k.contiguous()?.t()?.contiguous()?)? * scale)?;
        let att = match mask {
            Some(m) => att.broadcast_add(m)?,
            None => att,
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        att.matmul(&v.contiguous()?)
    }
}

/// Builds an additive causal mask of shape `(1, 1, seq_len, seq_len + offset)`,
/// `f32::NEG_INFINITY` above the diagonal and zero elsewhere.
pub fn causal_mask(seq_len: usize, offset: usize, dtype: DType, dev: &Device) -> Result<Option<Tensor>> {
    if seq_len <= 1 {
        return Ok(None);
    }
    let mask: Vec<_> = (0..seq_len)
        .flat_map(|i| (0..seq_len + offset).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0. }))
        .collect();
    let mask = Tensor::from_slice(&mask, (seq_len, seq_len + offset), dev)?;
    Ok(Some(mask.to_dtype(dtype)?.unsqueeze(0)?.unsqueeze(0)?))
}

/// Bicubic-resamples a `(rows, cols, channels)` tensor of `f32` values to
/// `(target, target, channels)`. Grounded on the `_get_abs_pos`/`_interpolated_position`
/// PIL-bicubic resamplers in the original CLIP/SAM position-embedding interpolation:
/// candle has no bicubic kernel, so this reimplements the classic Catmull-Rom
/// bicubic convolution directly over the flattened channel planes.
pub fn bicubic_resize_hwc(data: &[f32], rows: usize, cols: usize, channels: usize, target: usize) -> Vec<f32> {
    if rows == target && cols == target {
        return data.to_vec();
    }
    let cubic = |x: f32| -> f32 {
        let a = -0.5f32;
        let x = x.abs();
        if x <= 1.0 {
            (a + 2.0) * x.powi(3) - (a + 3.0) * x.powi(2) + 1.0
        } else if x < 2.0 {
            a * x.powi(3) - 5.0 * a * x.powi(2) + 8.0 * a * x - 4.0 * a
        } else {
            0.0
        }
    };
    let sample = |r: isize, c: isize, ch: usize| -> f32 {
        let r = r.clamp(0, rows as isize - 1) as usize;
        let c = c.clamp(0, cols as isize - 1) as usize;
        data[(r * cols + c) * channels + ch]
    };
    let scale_r = rows as f32 / target as f32;
    let scale_c = cols as f32 / target as f32;
    let mut out = vec![0f32; target * target * channels];
    for ty in 0..target {
        let sy = (ty as f32 + 0.5) * scale_r - 0.5;
        let sy_floor = sy.floor();
        for tx in 0..target {
            let sx = (tx as f32 + 0.5) * scale_c - 0.5;
            let sx_floor = sx.floor();
            for ch in 0..channels {
                let mut acc = 0f32;
                for m in -1..=2isize {
                    let wy = cubic(sy - (sy_floor + m as f32));
                    for n in -1..=2isize {
                        let wx = cubic(sx - (sx_floor + n as f32));
                        acc += wy * wx * sample(sy_floor as isize + m, sx_floor as isize + n, ch);
                    }
                }
                out[(ty * target + tx) * channels + ch] = acc;
            }
        }
    }
    out
}

/// Indexes a batch dimension with a scalar row, used in the rotary-embedding helpers
/// and decoder attention where per-sample slices are concatenated back together.
pub fn index_batch(t: &Tensor, i: usize) -> Result<Tensor> {
    t.i(i)?.unsqueeze(0)
}
