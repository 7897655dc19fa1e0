//! Top-level model: fuses vision tokens into the text embedding sequence by
//! type code, runs the decoder, and projects to vocabulary logits. Grounded
//! on `model.py::DeepSeekOCRModel.get_input_embeddings` and
//! `DeepSeekOCRForCausalLM`.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use crate::config::DeepSeekOcrConfig;
use crate::language::{KvCache, TransformerDecoder};
use crate::preprocessor::{TokenType, VisionInput};
use crate::vision::DeepEncoder;

/// The multimodal encoder: SAM+CLIP fusion plus the two marker embedding
/// vectors the token-type fusion step splices in.
#[derive(Debug)]
pub struct Encoder {
    pub deep_encoder: DeepEncoder,
    pub image_newline: Tensor,
    pub view_seperator: Tensor,
}

impl Encoder {
    pub fn new(cfg: &DeepSeekOcrConfig, vb: VarBuilder) -> Result<Self> {
        let deep_encoder = DeepEncoder::new(
            &cfg.vision_config.sam,
            &cfg.vision_config.clip,
            &cfg.projector_config,
            vb.pp("encoder"),
        )?;
        let image_newline = vb.get(cfg.projector_config.n_embed, "image_newline")?;
        let view_seperator = vb.get(cfg.projector_config.n_embed, "view_seperator")?;
        Ok(Self { deep_encoder, image_newline, view_seperator })
    }
}

#[derive(Debug)]
pub struct DeepSeekOcrModel {
    embed_tokens: Embedding,
    encoder: Encoder,
    language_model: TransformerDecoder,
    norm_eps: f64,
    hidden_size: usize,
}

impl DeepSeekOcrModel {
    pub fn new(cfg: &DeepSeekOcrConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = candle_nn::embedding(
            cfg.text_config.vocab_size,
            cfg.text_config.hidden_size,
            vb.pp("model.language_model.embed_tokens"),
        )?;
        let encoder = Encoder::new(cfg, vb.pp("model"))?;
        let language_model = TransformerDecoder::new(&cfg.text_config, vb.pp("model.language_model"))?;
        Ok(Self {
            embed_tokens,
            encoder,
            language_model,
            norm_eps: cfg.text_config.rms_norm_eps,
            hidden_size: cfg.text_config.hidden_size,
        })
    }

    /// Builds the fused input-embedding sequence for one request: starts from
    /// plain token embeddings, then scatters in vision-feature, newline, and
    /// separator embeddings at the positions `vision` marks by type code
    /// (`get_input_embeddings`'s in-place row replacement, done here via
    /// per-row tensor reconstruction since candle has no in-place scatter
    /// into an existing leaf tensor).
    pub fn input_embeddings(&self, input_ids: &Tensor, vision: Option<&VisionInput>) -> Result<Tensor> {
        let token_embeds = self.embed_tokens.forward(input_ids)?; // (1, seq, hidden)
        let Some(vision) = vision else { return Ok(token_embeds) };

        let local_tiles = vision.local_tiles.as_ref().map(|t| self.encoder.deep_encoder.encode_tiles(t)).transpose()?;
        let global_tile = self.encoder.deep_encoder.encode_tiles(&vision.global_tile)?;

        let mut vision_tokens = Vec::new();
        if let Some(locals) = &local_tiles {
            for i in 0..locals.dim(0)? {
                vision_tokens.push(locals.get(i)?);
            }
        }
        for i in 0..global_tile.dim(0)? {
            vision_tokens.push(global_tile.get(i)?);
        }
        let vision_flat = Tensor::cat(&vision_tokens, 0)?; // (n_vision_tokens, hidden)

        let seq_len = vision.token_types.len();
        let mut rows = Vec::with_capacity(seq_len);
        let mut vision_cursor = 0usize;
        for (pos, ty) in vision.token_types.iter().enumerate() {
            let row = match ty {
                TokenType::Text => token_embeds.i((0, pos))?,
                TokenType::Vision => {
                    let row = vision_flat.i(vision_cursor)?;
                    vision_cursor += 1;
                    row
                }
                TokenType::Newline => self.encoder.image_newline.clone(),
                TokenType::Separator => self.encoder.view_seperator.clone(),
            };
            rows.push(row.unsqueeze(0)?);
        }
        let fused = Tensor::cat(&rows, 0)?.unsqueeze(0)?;
        Ok(fused)
    }

    pub fn forward(&self, input_ids: &Tensor, vision: Option<&VisionInput>, cache: &mut KvCache) -> Result<Tensor> {
        let embeds = self.input_embeddings(input_ids, vision)?;
        self.language_model.forward(&embeds, cache)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn norm_eps(&self) -> f64 {
        self.norm_eps
    }
}

/// Wraps the base model with a language-modeling head, the unit the
/// generation loop actually drives.
#[derive(Debug)]
pub struct DeepSeekOcrForCausalLM {
    model: DeepSeekOcrModel,
    lm_head: Linear,
    device: Device,
    dtype: DType,
    num_hidden_layers: usize,
}

impl DeepSeekOcrForCausalLM {
    pub fn new(cfg: &DeepSeekOcrConfig, vb: VarBuilder) -> Result<Self> {
        let model = DeepSeekOcrModel::new(cfg, vb.clone())?;
        let lm_head = candle_nn::linear_no_bias(cfg.text_config.hidden_size, cfg.text_config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            model,
            lm_head,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            num_hidden_layers: cfg.text_config.num_hidden_layers,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.num_hidden_layers)
    }

    /// Runs one forward step and returns logits for the final position only,
    /// matching `generate.py`'s `logits[:, -1, :]` slice.
    pub fn forward_last_logits(
        &self,
        input_ids: &Tensor,
        vision: Option<&VisionInput>,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let hidden = self.model.forward(input_ids, vision, cache)?;
        let seq_len = hidden.dim(1)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?;
        self.lm_head.forward(&last)
    }
}
