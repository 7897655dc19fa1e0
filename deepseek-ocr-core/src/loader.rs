//! Ties configuration, weight loading, and tokenizer setup together into one
//! ready-to-generate model, the way `load.py::load`/`load_model` compose the
//! pieces in the original.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;

use crate::config::DeepSeekOcrConfig;
use crate::error::{OcrError, Result};
use crate::model::DeepSeekOcrForCausalLM;
use crate::preprocessor::Preprocessor;
use crate::weights::{load_checkpoint, with_marker_aliases};

pub struct LoadedModel {
    pub model: DeepSeekOcrForCausalLM,
    pub preprocessor: Preprocessor,
    pub config: DeepSeekOcrConfig,
}

/// Loads a local checkpoint directory containing `config.json`,
/// `tokenizer.json`, and one or more `model*.safetensors` shards.
pub fn load_local(dir: &Path, dtype: DType, device: &Device) -> Result<LoadedModel> {
    let config_path = dir.join("config.json");
    let raw_config = std::fs::read_to_string(&config_path)?;
    let config = DeepSeekOcrConfig::from_json(&raw_config)?;

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| OcrError::Tokenizer(format!("failed to load {}: {e}", tokenizer_path.display())))?;

    let tensors = load_checkpoint(dir, dtype, device)?;
    let tensors = with_marker_aliases(tensors)?;
    let vb = VarBuilder::from_tensors(tensors, dtype, device);

    let model = DeepSeekOcrForCausalLM::new(&config, vb)?;
    let preprocessor = Preprocessor::new(tokenizer);

    Ok(LoadedModel { model, preprocessor, config })
}

/// Resolves a HF Hub repo id to a local cache directory (downloading shards,
/// config, and tokenizer on first use) and loads it the same way as
/// [`load_local`].
pub fn load_from_hub(repo_id: &str, dtype: DType, device: &Device) -> Result<LoadedModel> {
    let api = hf_hub::api::sync::Api::new().map_err(|e| OcrError::Resource(e.to_string()))?;
    let repo = api.model(repo_id.to_string());

    let config_path = repo.get("config.json").map_err(|e| OcrError::Resource(e.to_string()))?;
    let tokenizer_path = repo.get("tokenizer.json").map_err(|e| OcrError::Resource(e.to_string()))?;

    let dir: PathBuf = config_path
        .parent()
        .ok_or_else(|| OcrError::Resource("could not resolve cache directory".into()))?
        .to_path_buf();
    let _ = tokenizer_path;

    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        if let Some(map) = index.get("weight_map").and_then(|v| v.as_object()) {
            let mut shard_names: Vec<&str> = map.values().filter_map(|v| v.as_str()).collect();
            shard_names.sort();
            shard_names.dedup();
            for shard in shard_names {
                repo.get(shard).map_err(|e| OcrError::Resource(e.to_string()))?;
            }
        }
    } else {
        repo.get("model.safetensors").map_err(|e| OcrError::Resource(e.to_string()))?;
    }

    load_local(&dir, dtype, device)
}
