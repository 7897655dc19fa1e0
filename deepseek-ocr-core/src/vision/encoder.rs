//! DeepEncoder: runs SAM and CLIP over each image tile, fuses the two feature
//! maps with a linear projector, and stitches per-tile token grids into the
//! local/global sequences consumed by the language model. Grounded on
//! `model.py::DeepEncoder` (`_encode_tiles`/`_encode_view`/`__call__`).

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::{ClipBackboneConfig, ProjectorConfig, SamBackboneConfig};
use crate::vision::clip::ClipVisionEncoder;
use crate::vision::sam::SamImageEncoder;

#[derive(Debug)]
pub struct Projector {
    proj: Linear,
    downsample_ratio: usize,
}

impl Projector {
    pub fn new(cfg: &ProjectorConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: candle_nn::linear(cfg.input_dim, cfg.n_embed, vb.pp("0"))?,
            downsample_ratio: cfg.downsample_ratio,
        })
    }

    /// Space-to-depth downsamples a `(b, h, w, c)` grid by `downsample_ratio`
    /// along both spatial axes before the linear projection, matching the
    /// `downsample_ratio` pixel-shuffle step used to cut token count.
    fn pixel_shuffle(&self, x: &Tensor) -> Result<Tensor> {
        let r = self.downsample_ratio;
        if r <= 1 {
            return Ok(x.clone());
        }
        let (b, h, w, c) = x.dims4()?;
        let x = x.reshape((b, h / r, r, w / r, r, c))?;
        let x = x.permute((0, 1, 3, 2, 4, 5))?.contiguous()?;
        x.reshape((b, h / r, w / r, c * r * r))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.pixel_shuffle(x)?;
        let (b, h, w, c) = x.dims4()?;
        let flat = x.reshape((b, h * w, c))?;
        self.proj.forward(&flat)
    }
}

#[derive(Debug)]
pub struct DeepEncoder {
    sam: SamImageEncoder,
    clip: ClipVisionEncoder,
    projector: Projector,
}

impl DeepEncoder {
    pub fn new(
        sam_cfg: &SamBackboneConfig,
        clip_cfg: &ClipBackboneConfig,
        projector_cfg: &ProjectorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let sam = SamImageEncoder::new(sam_cfg, clip_cfg.width, vb.pp("sam_model"))?;
        let clip = ClipVisionEncoder::new(clip_cfg, vb.pp("vision_model"))?;
        let projector = Projector::new(projector_cfg, vb.pp("projector"))?;
        Ok(Self { sam, clip, projector })
    }

    /// Encodes one batch of same-size tiles `(n, 3, h, w)` into projected
    /// tokens `(n, tokens_per_tile, n_embed)`, concatenating SAM's
    /// downsampled conv features with CLIP's patch tokens channel-wise
    /// before projection (`_encode_tiles`).
    pub fn encode_tiles(&self, tiles: &Tensor) -> Result<Tensor> {
        let sam_feat = self.sam.forward(tiles)?; // (n, c_sam, h', w')
        let sam_feat = sam_feat.permute((0, 2, 3, 1))?.contiguous()?; // (n, h', w', c_sam)

        let clip_feat = self.clip.forward(tiles)?; // (n, 1+gh*gw, c_clip)
        let n = clip_feat.dim(0)?;
        let c_clip = clip_feat.dim(2)?;
        let clip_patches = clip_feat.narrow(1, 1, clip_feat.dim(1)? - 1)?;
        let (h, w) = (sam_feat.dim(1)?, sam_feat.dim(2)?);
        let clip_patches = clip_patches.reshape((n, h, w, c_clip))?;

        let fused = Tensor::cat(&[&sam_feat, &clip_patches], 3)?;
        self.projector.forward(&fused)
    }

    /// Runs [`encode_tiles`] and reshapes the per-tile token grid back to
    /// `(queries, queries, n_embed)` per tile, the unit `_encode_view` wires
    /// into the local/global stitching logic in the caller.
    pub fn encode_view(&self, tiles: &Tensor) -> Result<Vec<Tensor>> {
        let tokens = self.encode_tiles(tiles)?; // (n, tokens, n_embed)
        let n = tokens.dim(0)?;
        (0..n).map(|i| tokens.get(i)).collect()
    }
}
