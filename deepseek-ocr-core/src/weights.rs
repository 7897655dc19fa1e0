//! Shard discovery and weight sanitization: renames checkpoint keys onto the
//! module paths this crate actually uses, stacks per-expert MoE weights into
//! a single tensor per projection, and casts everything to the runtime dtype.
//!
//! Grounded on `load.py` (shard globbing, f32->f16 cast) and
//! `model.py::DeepSeekOCRModel.sanitize` (key renames).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{OcrError, Result};

/// Finds `model*.safetensors` shards in a checkpoint directory, preferring
/// the sharded naming scheme but falling back to a single `model.safetensors`.
pub fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|e| e == "safetensors").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("model"))
                    .unwrap_or(false)
        })
        .collect();
    if shards.is_empty() {
        return Err(OcrError::Weight(format!("no safetensors shards found in {}", dir.display())));
    }
    shards.sort();
    Ok(shards)
}

/// Loads every shard into one flat name -> tensor map, applying [`sanitize`]
/// and a final cast to `dtype`.
pub fn load_checkpoint(dir: &Path, dtype: DType, device: &Device) -> Result<HashMap<String, Tensor>> {
    let shards = discover_shards(dir)?;
    let mut raw = HashMap::new();
    for shard in &shards {
        let tensors = candle_core::safetensors::load(shard, device)?;
        raw.extend(tensors);
    }
    let sanitized = sanitize(raw)?;
    sanitized
        .into_iter()
        .map(|(k, v)| {
            let cast = if v.dtype() == DType::F32 { v.to_dtype(dtype)? } else { v };
            Ok((k, cast))
        })
        .collect()
}

/// Applies the checkpoint -> module-tree renames this crate's module layout
/// needs, and stacks per-expert routed-MoE weights into one tensor per
/// projection. Conv weights are left in their stored `(out, in, kh, kw)`
/// layout: candle's `Conv2d` is NCHW-native, unlike the NHWC transpose the
/// original MLX port performs for its own conv layout, so no transpose is
/// needed here (see DESIGN.md).
pub fn sanitize(raw: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut out: HashMap<String, Tensor> = HashMap::new();
    let mut expert_groups: HashMap<String, HashMap<usize, Tensor>> = HashMap::new();

    for (key, tensor) in raw {
        let renamed = rename_key(&key);

        if let Some((prefix, expert_idx, suffix)) = split_expert_key(&renamed) {
            // Stacked tensors land under the fused `switch_mlp` path `MoeBlock`
            // loads via `vb.pp("switch_mlp")`.
            let group_key = format!("{prefix}.switch_mlp.{suffix}");
            expert_groups.entry(group_key).or_default().insert(expert_idx, tensor);
            continue;
        }

        let renamed = if renamed.ends_with(".rel_pos_h") || renamed.ends_with(".rel_pos_w") {
            tensor.to_dtype(DType::F32).map(|t| (renamed, t))?
        } else {
            (renamed, tensor)
        };
        out.insert(renamed.0, renamed.1);
    }

    for (group_key, mut experts) in expert_groups {
        let n = experts.keys().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut ordered = Vec::with_capacity(n);
        for i in 0..n {
            let t = experts.remove(&i).ok_or_else(|| {
                OcrError::Weight(format!("missing expert {i} while stacking {group_key}"))
            })?;
            ordered.push(t);
        }
        let stacked = Tensor::stack(&ordered, 0)?;
        out.insert(group_key, stacked);
    }

    Ok(out)
}

/// Renames one checkpoint key onto this crate's module paths. Mirrors
/// `DeepSeekOCRModel.sanitize`'s substring renames one-for-one.
fn rename_key(key: &str) -> String {
    let key = key.to_string();

    let key = if let Some(rest) = key.strip_prefix("model.sam_model.") {
        let rest = rest.replace(".net_2.", ".downsamples.0.").replace(".net_3.", ".downsamples.1.");
        format!("model.encoder.sam_model.{rest}")
    } else if let Some(rest) = key.strip_prefix("model.vision_model.") {
        let rest = rest.replace(".position_embedding.weight", ".position_embedding");
        format!("model.encoder.vision_model.{rest}")
    } else if let Some(rest) = key.strip_prefix("model.projector.") {
        let rest = rest.strip_prefix("layers.").unwrap_or(rest);
        format!("model.encoder.projector.{rest}")
    } else if key == "model.image_newline" || key == "model.view_seperator" {
        key.clone()
    } else if let Some(rest) = key.strip_prefix("model.embed_tokens.") {
        format!("model.language_model.embed_tokens.{rest}")
    } else if let Some(rest) = key.strip_prefix("model.layers.") {
        format!("model.language_model.layers.{rest}")
    } else if let Some(rest) = key.strip_prefix("model.norm.") {
        format!("model.language_model.norm.{rest}")
    } else {
        key.clone()
    };

    key
}

/// Splits a routed-expert weight key of the form `...experts.{n}.{proj}.weight`
/// into `(prefix, n, proj.weight)` so per-expert tensors can be regrouped and
/// stacked into `(num_experts, ...)`.
fn split_expert_key(key: &str) -> Option<(String, usize, String)> {
    let idx = key.find(".experts.")?;
    let prefix = key[..idx].to_string();
    let rest = &key[idx + ".experts.".len()..];
    let dot = rest.find('.')?;
    let expert_idx: usize = rest[..dot].parse().ok()?;
    let suffix = rest[dot + 1..].to_string();
    Some((prefix, expert_idx, suffix))
}

/// Duplicates the two top-level multimodal marker vectors under both their
/// original key and the `model.encoder.`-prefixed key, matching the
/// checkpoint's own duplicated storage (both the deep-encoder and the fusion
/// step reference them under different paths).
pub fn with_marker_aliases(mut tensors: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    for name in ["model.image_newline", "model.view_seperator"] {
        if let Some(t) = tensors.get(name).cloned() {
            let alias = name.replacen("model.", "model.encoder.", 1);
            tensors.entry(alias).or_insert(t);
        }
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renames_sam_net_downsamples() {
        assert_eq!(
            rename_key("model.sam_model.net_2.weight"),
            "model.encoder.sam_model.downsamples.0.weight"
        );
        assert_eq!(
            rename_key("model.sam_model.net_3.weight"),
            "model.encoder.sam_model.downsamples.1.weight"
        );
    }

    #[test]
    fn renames_vision_position_embedding() {
        assert_eq!(
            rename_key("model.vision_model.embeddings.position_embedding.weight"),
            "model.encoder.vision_model.embeddings.position_embedding"
        );
    }

    #[test]
    fn renames_projector_strips_layers_prefix() {
        assert_eq!(rename_key("model.projector.layers.0.weight"), "model.encoder.projector.0.weight");
        assert_eq!(rename_key("model.projector.0.weight"), "model.encoder.projector.0.weight");
    }

    #[test]
    fn renames_decoder_to_language_model() {
        assert_eq!(rename_key("model.embed_tokens.weight"), "model.language_model.embed_tokens.weight");
        assert_eq!(rename_key("model.layers.3.input_layernorm.weight"), "model.language_model.layers.3.input_layernorm.weight");
        assert_eq!(rename_key("model.norm.weight"), "model.language_model.norm.weight");
    }

    #[test]
    fn splits_expert_keys() {
        let (prefix, idx, suffix) = split_expert_key("model.language_model.layers.2.mlp.experts.5.gate_proj.weight").unwrap();
        assert_eq!(prefix, "model.language_model.layers.2.mlp");
        assert_eq!(idx, 5);
        assert_eq!(suffix, "gate_proj.weight");
    }

    #[test]
    fn sanitize_stacks_experts_under_switch_mlp() {
        let device = Device::Cpu;
        let mut raw = HashMap::new();
        for i in 0..3 {
            let key = format!("model.layers.2.mlp.experts.{i}.gate_proj.weight");
            raw.insert(key, Tensor::zeros((1, 1), DType::F32, &device).unwrap());
        }
        let sanitized = sanitize(raw).unwrap();
        let stacked = sanitized
            .get("model.language_model.layers.2.mlp.switch_mlp.gate_proj.weight")
            .expect("stacked expert tensor under switch_mlp path");
        assert_eq!(stacked.dims(), &[3, 1, 1]);
    }
}
