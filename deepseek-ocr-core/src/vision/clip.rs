//! CLIP-L/14 vision transformer: class token, bicubic-interpolated absolute
//! position embeddings, packed-QKV attention, QuickGELU MLP blocks. Grounded
//! on `model.py`'s `ClipVisionEmbeddings`/`ClipVisionAttention`/
//! `ClipVisionMLP`/`ClipVisionBlock`/`ClipVisionTransformer`.

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ClipBackboneConfig;
use crate::layers::bicubic_resize_hwc;

fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    (x * candle_nn::ops::sigmoid(&(x * 1.702)?)?)
}

#[derive(Debug)]
struct ClipEmbeddings {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Tensor,
    grid_size: usize,
}

impl ClipEmbeddings {
    fn new(cfg: &ClipBackboneConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embedding = conv2d_no_bias(
            3,
            cfg.width,
            cfg.patch_size,
            Conv2dConfig { stride: cfg.patch_size, ..Default::default() },
            vb.pp("patch_embedding"),
        )?;
        let grid_size = cfg.image_size / cfg.patch_size;
        let class_embedding = vb.get(cfg.width, "class_embedding")?;
        let position_embedding = vb.get((grid_size * grid_size + 1, cfg.width), "position_embedding")?;
        Ok(Self { patch_embedding, class_embedding, position_embedding, grid_size })
    }

    /// Bicubically resamples the grid portion of the position embedding to
    /// `target_grid`, leaving the class-token row untouched (`_get_abs_pos`).
    fn interpolated_position(&self, target_grid: usize, dtype: DType) -> Result<Tensor> {
        let dim = self.position_embedding.dim(1)?;
        if target_grid == self.grid_size {
            return self.position_embedding.to_dtype(dtype);
        }
        let cls_row = self.position_embedding.i(0)?.unsqueeze(0)?;
        let grid_rows = self.position_embedding.i(1..)?;
        let data = grid_rows.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let resized = bicubic_resize_hwc(&data, self.grid_size, self.grid_size, dim, target_grid);
        let resized = Tensor::from_vec(resized, (target_grid * target_grid, dim), self.position_embedding.device())?;
        Tensor::cat(&[cls_row, resized], 0)?.to_dtype(dtype)
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b, _, _, _) = pixel_values.dims4()?;
        let patches = self.patch_embedding.forward(pixel_values)?; // (b, c, gh, gw)
        let (_, c, gh, gw) = patches.dims4()?;
        let patches = patches.reshape((b, c, gh * gw))?.transpose(1, 2)?.contiguous()?; // (b, n, c)
        let cls = self.class_embedding.reshape((1, 1, c))?.broadcast_as((b, 1, c))?;
        let embeddings = Tensor::cat(&[cls, patches], 1)?;
        let pos = self.interpolated_position(gh, embeddings.dtype())?;
        embeddings.broadcast_add(&pos.unsqueeze(0)?)
    }
}

#[derive(Debug)]
struct ClipAttention {
    qkv: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl ClipAttention {
    fn new(width: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            qkv: candle_nn::linear(width, width * 3, vb.pp("qkv"))?,
            out_proj: candle_nn::linear(width, width, vb.pp("out_proj"))?,
            num_heads: heads,
            head_dim: width / heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        let qkv = self.qkv.forward(x)?.reshape((b, s, 3, self.num_heads, self.head_dim))?;
        let q = qkv.i((.., .., 0))?.permute((0, 2, 1, 3))?.contiguous()?;
        let k = qkv.i((.., .., 1))?.permute((0, 2, 1, 3))?.contiguous()?;
        let v = qkv.i((.., .., 2))?.permute((0, 2, 1, 3))?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.permute((0, 2, 1, 3))?.reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
}

impl ClipMlp {
    fn new(width: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(width, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, width, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&quick_gelu(&self.fc1.forward(x)?)?)
    }
}

#[derive(Debug)]
struct ClipBlock {
    layer_norm1: LayerNorm,
    attn: ClipAttention,
    layer_norm2: LayerNorm,
    mlp: ClipMlp,
}

impl ClipBlock {
    fn new(cfg: &ClipBackboneConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(cfg.width, 1e-5, vb.pp("layer_norm1"))?,
            attn: ClipAttention::new(cfg.width, cfg.heads, vb.pp("self_attn"))?,
            layer_norm2: candle_nn::layer_norm(cfg.width, 1e-5, vb.pp("layer_norm2"))?,
            mlp: ClipMlp::new(cfg.width, (cfg.width as f64 * cfg.mlp_ratio) as usize, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.layer_norm1.forward(x)?)?)?;
        &x + self.mlp.forward(&self.layer_norm2.forward(&x)?)?
    }
}

#[derive(Debug)]
pub struct ClipVisionEncoder {
    embeddings: ClipEmbeddings,
    pre_layrnorm: LayerNorm,
    blocks: Vec<ClipBlock>,
}

impl ClipVisionEncoder {
    pub fn new(cfg: &ClipBackboneConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = ClipEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let pre_layrnorm = candle_nn::layer_norm(cfg.width, 1e-5, vb.pp("pre_layrnorm"))?;
        let vb_layers = vb.pp("encoder.layers");
        let mut blocks = Vec::with_capacity(cfg.layers);
        for i in 0..cfg.layers {
            blocks.push(ClipBlock::new(cfg, vb_layers.pp(i))?);
        }
        Ok(Self { embeddings, pre_layrnorm, blocks })
    }

    /// Returns the full `(b, 1 + grid*grid, width)` hidden-state sequence
    /// (patch tokens follow the class token at index 0); callers drop the
    /// class token before fusing with the SAM feature map.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self.embeddings.forward(pixel_values)?;
        let mut x = self.pre_layrnorm.forward(&x)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}
