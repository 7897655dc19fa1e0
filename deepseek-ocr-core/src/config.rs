//! Configuration objects mirroring the checkpoint's `config.json` layout:
//! a language sub-config (DeepSeek-V2 decoder), a vision sub-config (SAM +
//! CLIP backbones), and a projector sub-config, composed under one top-level
//! `DeepSeekOcrConfig`. Field names and defaults are load-bearing: they must
//! match whatever shipped in the checkpoint being loaded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OcrError, Result};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub moe_intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub n_shared_experts: usize,
    pub n_routed_experts: usize,
    pub num_experts_per_tok: usize,
    pub first_k_dense_replace: usize,
    pub max_position_embeddings: usize,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub rope_theta: f64,
    pub rms_norm_eps: f64,
    pub topk_method: String,
    pub topk_group: usize,
    pub n_group: usize,
    pub use_mla: bool,
    pub routed_scaling_factor: f64,
    pub kv_lora_rank: Option<usize>,
    pub q_lora_rank: Option<usize>,
    pub qk_nope_head_dim: usize,
    pub qk_rope_head_dim: usize,
    pub v_head_dim: usize,
    pub rope_scaling: Option<HashMap<String, f64>>,
    #[serde(default = "default_true")]
    pub rope_traditional: bool,
    pub attention_bias: bool,
    pub scoring_func: String,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            model_type: "deepseek_v2".to_string(),
            vocab_size: 129_280,
            hidden_size: 1_280,
            intermediate_size: 6_848,
            moe_intermediate_size: 896,
            num_hidden_layers: 12,
            num_attention_heads: 10,
            num_key_value_heads: 10,
            n_shared_experts: 2,
            n_routed_experts: 64,
            num_experts_per_tok: 6,
            first_k_dense_replace: 1,
            max_position_embeddings: 8_192,
            bos_token_id: 0,
            eos_token_id: 1,
            rope_theta: 10_000.0,
            rms_norm_eps: 1e-6,
            topk_method: "greedy".to_string(),
            topk_group: 1,
            n_group: 1,
            use_mla: false,
            routed_scaling_factor: 1.0,
            kv_lora_rank: None,
            q_lora_rank: None,
            qk_nope_head_dim: 0,
            qk_rope_head_dim: 0,
            v_head_dim: 0,
            rope_scaling: None,
            rope_traditional: true,
            attention_bias: false,
            scoring_func: "softmax".to_string(),
        }
    }
}

impl LanguageConfig {
    /// `true` when the checkpoint uses DeepSeek-V2's split NOPE/ROPE MLA
    /// attention; `false` falls back to plain LLaMA-style attention, matching
    /// the HF config this model ships with.
    pub fn uses_deepseek_split_attention(&self) -> bool {
        self.qk_nope_head_dim + self.qk_rope_head_dim > 0
    }

    pub fn q_head_dim(&self) -> usize {
        self.qk_nope_head_dim + self.qk_rope_head_dim
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamBackboneConfig {
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
    pub patch_size: usize,
    pub image_size: usize,
    pub mlp_ratio: f64,
    pub global_attn_indexes: Vec<usize>,
    pub downsample_channels: Vec<usize>,
}

impl Default for SamBackboneConfig {
    fn default() -> Self {
        Self {
            width: 768,
            layers: 12,
            heads: 12,
            patch_size: 16,
            image_size: 1_024,
            mlp_ratio: 4.0,
            global_attn_indexes: vec![2, 5, 8, 11],
            downsample_channels: vec![512, 1024],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipBackboneConfig {
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub mlp_ratio: f64,
}

impl Default for ClipBackboneConfig {
    fn default() -> Self {
        Self {
            width: 1_024,
            layers: 24,
            heads: 16,
            image_size: 224,
            patch_size: 14,
            mlp_ratio: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub model_type: String,
    pub image_size: usize,
    pub mlp_ratio: f64,
    pub sam: SamBackboneConfig,
    pub clip: ClipBackboneConfig,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model_type: "vision".to_string(),
            image_size: 1_024,
            mlp_ratio: 3.7362,
            sam: SamBackboneConfig::default(),
            clip: ClipBackboneConfig::default(),
        }
    }
}

impl VisionConfig {
    /// The checkpoint nests SAM/CLIP sub-configs under a `width` map keyed by
    /// `sam_vit_b`/`clip-l-14-224` instead of plain `sam`/`clip` keys — a
    /// legacy naming quirk from the upstream export script. Normalize it here
    /// rather than replicate the quirk throughout the rest of the crate.
    fn from_value(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(map) => map,
            _ => return Ok(Self::default()),
        };
        if let Some(Value::Object(width_section)) = obj.remove("width") {
            if let Some(sam_raw) = width_section.get("sam_vit_b").cloned() {
                obj.insert("sam".to_string(), sam_raw);
            }
            if let Some(clip_raw) = width_section.get("clip-l-14-224").cloned() {
                obj.insert("clip".to_string(), clip_raw);
            }
        }
        let value = Value::Object(obj);
        serde_json::from_value(value)
            .map_err(|e| OcrError::Configuration(format!("invalid vision_config: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorConfig {
    pub projector_type: String,
    pub input_dim: usize,
    pub n_embed: usize,
    pub depth: usize,
    pub mlp_ratio: usize,
    pub downsample_ratio: usize,
    pub token_pooling: bool,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            projector_type: "linear".to_string(),
            input_dim: 2_048,
            n_embed: 1_280,
            depth: 1,
            mlp_ratio: 1,
            downsample_ratio: 4,
            token_pooling: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSeekOcrConfig {
    pub model_type: String,
    pub text_config: LanguageConfig,
    pub vision_config: VisionConfig,
    pub projector_config: ProjectorConfig,
    pub tile_tag: String,
    pub global_view_pos: String,
    pub candidate_resolutions: Vec<[usize; 2]>,
    pub eos_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
}

impl Default for DeepSeekOcrConfig {
    fn default() -> Self {
        Self {
            model_type: "deepseek_ocr".to_string(),
            text_config: LanguageConfig::default(),
            vision_config: VisionConfig::default(),
            projector_config: ProjectorConfig::default(),
            tile_tag: "2D".to_string(),
            global_view_pos: "head".to_string(),
            candidate_resolutions: vec![[1_024, 1_024]],
            eos_token_id: Some(1),
            bos_token_id: Some(0),
        }
    }
}

impl DeepSeekOcrConfig {
    /// Parses a HF-style `config.json`. Handles the legacy alias where older
    /// checkpoints store the decoder config under `language_config` instead
    /// of `text_config`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| OcrError::Configuration("config.json root must be an object".into()))?;

        if let Some(legacy) = obj.remove("language_config") {
            obj.entry("text_config".to_string()).or_insert(legacy);
        }

        let text_config = match obj.remove("text_config") {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| OcrError::Configuration(format!("invalid text_config: {e}")))?,
            None => LanguageConfig::default(),
        };
        let vision_config = match obj.remove("vision_config") {
            Some(v) => VisionConfig::from_value(v)?,
            None => VisionConfig::default(),
        };
        let projector_config = match obj.remove("projector_config") {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| OcrError::Configuration(format!("invalid projector_config: {e}")))?,
            None => ProjectorConfig::default(),
        };

        let default = Self::default();
        let get_str = |key: &str, default: &str| -> String {
            obj.get(key).and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| default.to_string())
        };
        let candidate_resolutions = obj
            .get("candidate_resolutions")
            .and_then(|v| serde_json::from_value::<Vec<[usize; 2]>>(v.clone()).ok())
            .unwrap_or(default.candidate_resolutions);

        Ok(Self {
            model_type: get_str("model_type", &default.model_type),
            text_config,
            vision_config,
            projector_config,
            tile_tag: get_str("tile_tag", &default.tile_tag),
            global_view_pos: get_str("global_view_pos", &default.global_view_pos),
            candidate_resolutions,
            eos_token_id: obj.get("eos_token_id").and_then(Value::as_u64).map(|v| v as u32).or(default.eos_token_id),
            bos_token_id: obj.get("bos_token_id").and_then(Value::as_u64).map(|v| v as u32).or(default.bos_token_id),
        })
    }

    pub fn base_resolution(&self) -> usize {
        self.candidate_resolutions.first().map(|r| r[0]).unwrap_or(1_024)
    }
}
