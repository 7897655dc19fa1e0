//! SAM (Segment Anything) ViT-B image encoder: windowed attention with
//! decomposed relative position bias, a handful of global-attention layers,
//! and a conv neck producing the final feature map. Grounded on
//! `sam_custom.py`'s `ImageEncoderViT_MLX`/`Block`/`Attention`.

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder};

use crate::config::SamBackboneConfig;

/// Resamples a `(rows, channels)` table to `target` rows along axis 0 using
/// the same Catmull-Rom cubic kernel the 2-D position-embedding resampler
/// uses, kept separate here since the relative-position table is 1-D.
fn cubic_resample_rows(data: &[f32], rows: usize, channels: usize, target: usize) -> Vec<f32> {
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
    let sample = |r: isize, ch: usize| -> f32 {
        let r = r.clamp(0, rows as isize - 1) as usize;
        data[r * channels + ch]
    };
    let scale = rows as f32 / target as f32;
    let mut out = vec![0f32; target * channels];
    for t in 0..target {
        let s = (t as f32 + 0.5) * scale - 0.5;
        let s_floor = s.floor();
        for ch in 0..channels {
            let mut acc = 0f32;
            for m in -1..=2isize {
                let w = cubic(s - (s_floor + m as f32));
                acc += w * sample(s_floor as isize + m, ch);
            }
            out[t * channels + ch] = acc;
        }
    }
    out
}

fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    if bias {
        candle_nn::linear(in_dim, out_dim, vb)
    } else {
        candle_nn::linear_no_bias(in_dim, out_dim, vb)
    }
}

fn layer_norm(size: usize, vb: VarBuilder) -> Result<LayerNorm> {
    candle_nn::layer_norm(size, 1e-6, vb)
}

/// Patch embedding: a single stride-`patch_size` conv producing `(b, h, w, c)`
/// tokens (transposed from candle's native NCHW conv output).
#[derive(Debug)]
struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn new(patch_size: usize, in_chans: usize, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig { stride: patch_size, ..Default::default() };
        let proj = conv2d(in_chans, embed_dim, patch_size, cfg, vb.pp("proj"))?;
        Ok(Self { proj })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.proj.forward(x)?; // (b, c, h, w)
        x.permute((0, 2, 3, 1))?.contiguous()
    }
}

/// Decomposed relative position bias lookup table for one axis, bicubically
/// resampled when the runtime window size differs from the table's native
/// extent (`_get_rel_pos` in the original).
fn get_rel_pos(q_size: usize, k_size: usize, rel_pos: &Tensor) -> Result<Tensor> {
    let max_rel_dist = 2 * q_size.max(k_size) - 1;
    let native = rel_pos.dim(0)?;
    let dim = rel_pos.dim(1)?;
    let resized = if native != max_rel_dist {
        let data = rel_pos.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let resampled = cubic_resample_rows(&data, native, dim, max_rel_dist);
        Tensor::from_vec(resampled, (max_rel_dist, dim), rel_pos.device())?.to_dtype(rel_pos.dtype())?
    } else {
        rel_pos.clone()
    };

    let q_coords: Vec<f32> = (0..q_size).map(|i| i as f32 * (k_size as f32 / q_size as f32).max(1.0)).collect();
    let k_coords: Vec<f32> = (0..k_size).map(|i| i as f32 * (q_size as f32 / k_size as f32).max(1.0)).collect();
    let offset = (k_size as f32 - 1.0) * (q_size as f32 / k_size as f32).max(1.0);

    let mut idx = Vec::with_capacity(q_size * k_size);
    for &qc in &q_coords {
        for &kc in &k_coords {
            let rel = (qc - kc + offset).round() as i64;
            idx.push(rel.clamp(0, max_rel_dist as i64 - 1) as u32);
        }
    }
    let idx = Tensor::from_vec(idx, q_size * k_size, resized.device())?;
    let gathered = resized.index_select(&idx, 0)?;
    gathered.reshape((q_size, k_size, dim))
}

/// Adds the decomposed relative position bias to an attention score tensor,
/// mirroring `_add_decomposed_rel_pos`'s einsum-based construction.
fn add_decomposed_rel_pos(
    attn: &Tensor,
    q: &Tensor,
    rel_pos_h: &Tensor,
    rel_pos_w: &Tensor,
    q_hw: (usize, usize),
    k_hw: (usize, usize),
) -> Result<Tensor> {
    let (q_h, q_w) = q_hw;
    let (k_h, k_w) = k_hw;
    let rh = get_rel_pos(q_h, k_h, rel_pos_h)?;
    let rw = get_rel_pos(q_w, k_w, rel_pos_w)?;

    let (b, _, dim) = q.dims3()?;
    let r_q = q.reshape((b, q_h, q_w, dim))?;

    // rel_h[b, qh, qw, kh] = sum_c r_q[b, qh, qw, c] * rh[qh, kh, c]
    let rel_h = r_q
        .permute((1, 0, 2, 3))? // (qh, b, qw, c)
        .reshape((q_h, b * q_w, dim))?
        .matmul(&rh.transpose(1, 2)?.contiguous()?.reshape((q_h, dim, k_h))?.broadcast_as((q_h, dim, k_h))?)?
        .reshape((q_h, b, q_w, k_h))?
        .permute((1, 0, 2, 3))?; // (b, qh, qw, kh)

    let rel_w = r_q
        .permute((2, 0, 1, 3))? // (qw, b, qh, c)
        .reshape((q_w, b * q_h, dim))?
        .matmul(&rw.transpose(1, 2)?.contiguous()?.reshape((q_w, dim, k_w))?.broadcast_as((q_w, dim, k_w))?)?
        .reshape((q_w, b, q_h, k_w))?
        .permute((1, 2, 0, 3))?; // (b, qh, qw, kw)

    let attn = attn.reshape((b, q_h, q_w, k_h, k_w))?;
    let attn = attn.broadcast_add(&rel_h.unsqueeze(4)?)?;
    let attn = attn.broadcast_add(&rel_w.unsqueeze(3)?)?;
    attn.reshape((b, q_h * q_w, k_h * k_w))
}

#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    use_rel_pos: bool,
    rel_pos_h: Option<Tensor>,
    rel_pos_w: Option<Tensor>,
}

impl Attention {
    fn new(dim: usize, num_heads: usize, input_size: (usize, usize), vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let qkv = linear(dim, dim * 3, true, vb.pp("qkv"))?;
        let proj = linear(dim, dim, true, vb.pp("proj"))?;
        let max_rel = 2 * input_size.0.max(input_size.1) - 1;
        let rel_pos_h = vb.pp("rel_pos_h").get((max_rel, head_dim), "rel_pos_h").ok();
        let rel_pos_w = vb.pp("rel_pos_w").get((max_rel, head_dim), "rel_pos_w").ok();
        Ok(Self {
            qkv,
            proj,
            num_heads,
            head_dim,
            use_rel_pos: rel_pos_h.is_some(),
            rel_pos_h,
            rel_pos_w,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, h, w, c) = x.dims4()?;
        let n = h * w;
        let qkv = self.qkv.forward(&x.reshape((b, n, c))?)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?
            .reshape((3, b * self.num_heads, n, self.head_dim))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(1, 2)?.contiguous()?)? * scale)?;
        let attn = if self.use_rel_pos {
            add_decomposed_rel_pos(
                &attn,
                &q,
                self.rel_pos_h.as_ref().unwrap(),
                self.rel_pos_w.as_ref().unwrap(),
                (h, w),
                (h, w),
            )?
        } else {
            attn
        };
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?
            .reshape((b, self.num_heads, h, w, self.head_dim))?
            .permute((0, 2, 3, 1, 4))?
            .reshape((b, h, w, c))?;
        self.proj.forward(&out)
    }
}

fn window_partition(x: &Tensor, window_size: usize) -> Result<(Tensor, (usize, usize))> {
    let (b, h, w, c) = x.dims4()?;
    let pad_h = (window_size - h % window_size) % window_size;
    let pad_w = (window_size - w % window_size) % window_size;
    let x = if pad_h > 0 || pad_w > 0 {
        x.pad_with_zeros(1, 0, pad_h)?.pad_with_zeros(2, 0, pad_w)?
    } else {
        x.clone()
    };
    let (hp, wp) = (h + pad_h, w + pad_w);
    let windows = x
        .reshape((b, hp / window_size, window_size, wp / window_size, window_size, c))?
        .permute((0, 1, 3, 2, 4, 5))?
        .reshape(((b * (hp / window_size) * (wp / window_size)), window_size, window_size, c))?;
    Ok((windows, (hp, wp)))
}

fn window_unpartition(windows: &Tensor, window_size: usize, pad_hw: (usize, usize), hw: (usize, usize)) -> Result<Tensor> {
    let (hp, wp) = pad_hw;
    let (h, w) = hw;
    let c = windows.dim(D::Minus1)?;
    let b = windows.dim(0)? / ((hp / window_size) * (wp / window_size));
    let x = windows
        .reshape((b, hp / window_size, wp / window_size, window_size, window_size, c))?
        .permute((0, 1, 3, 2, 4, 5))?
        .reshape((b, hp, wp, c))?;
    if hp > h || wp > w {
        x.narrow(1, 0, h)?.narrow(2, 0, w)
    } else {
        Ok(x)
    }
}

#[derive(Debug)]
struct MlpBlock {
    lin1: Linear,
    lin2: Linear,
}

impl MlpBlock {
    fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin1: linear(dim, hidden, true, vb.pp("lin1"))?,
            lin2: linear(hidden, dim, true, vb.pp("lin2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.lin2.forward(&self.lin1.forward(x)?.gelu_erf()?)
    }
}

#[derive(Debug)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: MlpBlock,
    window_size: usize,
}

impl Block {
    fn new(dim: usize, num_heads: usize, mlp_ratio: f64, window_size: usize, input_size: (usize, usize), vb: VarBuilder) -> Result<Self> {
        let attn_input = if window_size > 0 { (window_size, window_size) } else { input_size };
        Ok(Self {
            norm1: layer_norm(dim, vb.pp("norm1"))?,
            attn: Attention::new(dim, num_heads, attn_input, vb.pp("attn"))?,
            norm2: layer_norm(dim, vb.pp("norm2"))?,
            mlp: MlpBlock::new(dim, (dim as f64 * mlp_ratio) as usize, vb.pp("mlp"))?,
            window_size,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shortcut = x.clone();
        let x = self.norm1.forward(x)?;
        let (h, w) = (x.dim(1)?, x.dim(2)?);
        let (x, pad_hw) = if self.window_size > 0 {
            window_partition(&x, self.window_size)?
        } else {
            (x, (h, w))
        };
        let x = self.attn.forward(&x)?;
        let x = if self.window_size > 0 {
            window_unpartition(&x, self.window_size, pad_hw, (h, w))?
        } else {
            x
        };
        let x = (shortcut + x)?;
        let mlp_out = self.mlp.forward(&self.norm2.forward(&x)?)?;
        x + mlp_out
    }
}

#[derive(Debug)]
pub struct SamImageEncoder {
    patch_embed: PatchEmbed,
    pos_embed: Option<Tensor>,
    blocks: Vec<Block>,
    neck_conv1: Conv2d,
    neck_ln1: LayerNorm,
    neck_conv2: Conv2d,
    neck_ln2: LayerNorm,
    downsamples: Vec<Conv2d>,
}

impl SamImageEncoder {
    pub fn new(cfg: &SamBackboneConfig, out_chans: usize, vb: VarBuilder) -> Result<Self> {
        let patch_embed = PatchEmbed::new(cfg.patch_size, 3, cfg.width, vb.pp("patch_embed"))?;
        let grid = cfg.image_size / cfg.patch_size;
        let pos_embed = vb.get((1, grid, grid, cfg.width), "pos_embed").ok();

        let window_size = 14;
        let mut blocks = Vec::with_capacity(cfg.layers);
        let vb_blocks = vb.pp("blocks");
        for i in 0..cfg.layers {
            let ws = if cfg.global_attn_indexes.contains(&i) { 0 } else { window_size };
            blocks.push(Block::new(cfg.width, cfg.heads, cfg.mlp_ratio, ws, (grid, grid), vb_blocks.pp(i))?);
        }

        let neck_conv1 = conv2d(cfg.width, out_chans, 1, Conv2dConfig::default(), vb.pp("neck.0"))?;
        let neck_ln1 = layer_norm(out_chans, vb.pp("neck.1"))?;
        let neck_conv2 = conv2d(
            out_chans,
            out_chans,
            3,
            Conv2dConfig { padding: 1, ..Default::default() },
            vb.pp("neck.2"),
        )?;
        let neck_ln2 = layer_norm(out_chans, vb.pp("neck.3"))?;

        let mut downsamples = Vec::new();
        let mut in_c = out_chans;
        for (i, &out_c) in cfg.downsample_channels.iter().enumerate() {
            downsamples.push(conv2d(
                in_c,
                out_c,
                3,
                Conv2dConfig { stride: 2, padding: 1, ..Default::default() },
                vb.pp("downsamples").pp(i),
            )?);
            in_c = out_c;
        }

        Ok(Self { patch_embed, pos_embed, blocks, neck_conv1, neck_ln1, neck_conv2, neck_ln2, downsamples })
    }

    /// Runs the full SAM tower on a `(b, 3, h, w)` batch, returning the final
    /// downsampled feature map in `(b, c, h', w')` layout.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = self.patch_embed.forward(x)?; // (b, h, w, c)
        if let Some(pos) = &self.pos_embed {
            x = x.broadcast_add(pos)?;
        }
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = x.permute((0, 3, 1, 2))?.contiguous()?; // NCHW for conv neck
        let x = self.neck_conv1.forward(&x)?;
        let x = channels_last_layer_norm(&x, &self.neck_ln1)?;
        let x = self.neck_conv2.forward(&x)?;
        let mut x = channels_last_layer_norm(&x, &self.neck_ln2)?;
        for ds in &self.downsamples {
            x = ds.forward(&x)?;
        }
        Ok(x)
    }
}

/// Applies a LayerNorm defined over the channel axis to an NCHW tensor by
/// temporarily permuting to NHWC, matching the original's channels-last norm
/// placement inside a conv neck.
fn channels_last_layer_norm(x: &Tensor, norm: &LayerNorm) -> Result<Tensor> {
    let x_nhwc = x.permute((0, 2, 3, 1))?.contiguous()?;
    let normed = norm.forward(&x_nhwc)?;
    normed.permute((0, 3, 1, 2))?.contiguous()
}
