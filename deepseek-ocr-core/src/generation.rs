//! Prefill + autoregressive decode loop: one forward pass over the full
//! prompt (with vision inputs), then single-token steps sampling with
//! optional temperature until a stop condition fires. Grounded on
//! `generate.py` (`GenerationConfig`/`_sample_token`/`generate`).

use std::collections::HashSet;

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;

use crate::error::Result;
use crate::model::DeepSeekOcrForCausalLM;
use crate::preprocessor::{input_ids_tensor, VisionInput};

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub eos_token_id: u32,
    pub stop_token_ids: HashSet<u32>,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 4096,
            temperature: 0.0,
            eos_token_id: 1,
            stop_token_ids: HashSet::new(),
            seed: 0,
        }
    }
}

#[derive(Debug)]
pub struct GenerationResult {
    pub token_ids: Vec<u32>,
    pub stopped_on_eos: bool,
}

fn sample_token(logits: &Tensor, cfg: &GenerationConfig, rng: &mut rand::rngs::StdRng) -> Result<u32> {
    let logits = logits.to_dtype(DType::F32)?.flatten_all()?;
    if cfg.temperature <= 0.0 {
        let argmax = logits.argmax(0)?;
        return Ok(argmax.to_scalar::<u32>()?);
    }
    let scaled = (logits / cfg.temperature)?;
    let probs = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec1::<f32>()?;
    let dist = WeightedIndex::new(&probs).map_err(|e| crate::error::OcrError::Arithmetic(e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// Runs prefill over `prompt_ids` (with any associated vision tensors) and
/// then decodes token-by-token until EOS, a configured stop token, or
/// `max_new_tokens` is reached.
pub fn generate(
    model: &DeepSeekOcrForCausalLM,
    prompt_ids: &[u32],
    vision: Option<&VisionInput>,
    cfg: &GenerationConfig,
) -> Result<GenerationResult> {
    use rand::rngs::StdRng;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut cache = model.new_cache();

    let input_ids = input_ids_tensor(prompt_ids, model.device())?;
    let logits = model.forward_last_logits(&input_ids, vision, &mut cache)?;
    let mut next = sample_token(&logits, cfg, &mut rng)?;

    let mut generated = Vec::with_capacity(cfg.max_new_tokens);
    let mut stopped_on_eos = false;

    for _ in 0..cfg.max_new_tokens {
        if next == cfg.eos_token_id || cfg.stop_token_ids.contains(&next) {
            stopped_on_eos = true;
            break;
        }
        generated.push(next);

        let step_input = input_ids_tensor(&[next], model.device())?;
        let logits = model.forward_last_logits(&step_input, None, &mut cache)?;
        next = sample_token(&logits, cfg, &mut rng)?;
    }

    Ok(GenerationResult { token_ids: generated, stopped_on_eos })
}
