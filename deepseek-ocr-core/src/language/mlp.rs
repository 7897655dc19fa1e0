//! Dense MLP and MoE block. The MoE gate supports both the plain greedy
//! top-k scheme and DeepSeek-V2's `noaux_tc` group-constrained top-k with a
//! per-expert correction bias, dispatching to a stack of routed experts plus
//! always-on shared experts. Grounded on `model.py`'s `_patched_moe_gate_call`
//! and the teacher's mixture-of-experts dispatch idiom.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::LanguageConfig;

fn linear_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    candle_nn::linear_no_bias(in_dim, out_dim, vb)
}

#[derive(Debug)]
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Stacked routed experts: `(num_experts, intermediate, hidden)`-shaped
/// weight tensors indexed per-token by the gate's top-k selection, applied
/// one token at a time since batch size is always 1 in this engine.
#[derive(Debug)]
struct RoutedExperts {
    gate_proj: Tensor,
    up_proj: Tensor,
    down_proj: Tensor,
}

impl RoutedExperts {
    fn new(num_experts: usize, hidden_size: usize, moe_intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: vb.get((num_experts, moe_intermediate_size, hidden_size), "gate_proj.weight")?,
            up_proj: vb.get((num_experts, moe_intermediate_size, hidden_size), "up_proj.weight")?,
            down_proj: vb.get((num_experts, hidden_size, moe_intermediate_size), "down_proj.weight")?,
        })
    }

    fn forward_one(&self, expert: usize, x: &Tensor) -> Result<Tensor> {
        let gate_w = self.gate_proj.get(expert)?;
        let up_w = self.up_proj.get(expert)?;
        let down_w = self.down_proj.get(expert)?;
        let gate = x.matmul(&gate_w.t()?.contiguous()?)?.silu()?;
        let up = x.matmul(&up_w.t()?.contiguous()?)?;
        (gate * up)?.matmul(&down_w.t()?.contiguous()?)
    }
}

#[derive(Debug)]
pub struct MoeBlock {
    gate: Linear,
    score_correction_bias: Option<Tensor>,
    experts: RoutedExperts,
    shared_experts: Option<Mlp>,
    num_experts_per_tok: usize,
    n_group: usize,
    topk_group: usize,
    topk_method: String,
    routed_scaling_factor: f64,
    scoring_func: String,
}

impl MoeBlock {
    pub fn new(cfg: &LanguageConfig, vb: VarBuilder) -> Result<Self> {
        let gate = linear_no_bias(cfg.hidden_size, cfg.n_routed_experts, vb.pp("gate"))?;
        let score_correction_bias = vb.pp("gate").get(cfg.n_routed_experts, "e_score_correction_bias").ok();
        let experts = RoutedExperts::new(cfg.n_routed_experts, cfg.hidden_size, cfg.moe_intermediate_size, vb.pp("switch_mlp"))?;
        let shared_experts = if cfg.n_shared_experts > 0 {
            Some(Mlp::new(cfg.hidden_size, cfg.moe_intermediate_size * cfg.n_shared_experts, vb.pp("shared_experts"))?)
        } else {
            None
        };
        Ok(Self {
            gate,
            score_correction_bias,
            experts,
            shared_experts,
            num_experts_per_tok: cfg.num_experts_per_tok,
            n_group: cfg.n_group,
            topk_group: cfg.topk_group,
            topk_method: cfg.topk_method.clone(),
            routed_scaling_factor: cfg.routed_scaling_factor,
            scoring_func: cfg.scoring_func.clone(),
        })
    }

    /// Computes per-token routed-expert weights, applying group-constrained
    /// top-k and the correction-bias reranking `noaux_tc` uses when selected.
    fn route(&self, scores: &[f32], num_experts: usize) -> Vec<(usize, f32)> {
        let biased: Vec<f32> = match &self.score_correction_bias {
            Some(bias) if self.topk_method == "noaux_tc" => {
                let bias = bias.to_dtype(DType::F32).ok().and_then(|b| b.to_vec1::<f32>().ok()).unwrap_or_default();
                scores.iter().zip(bias.iter()).map(|(s, b)| s + b).collect()
            }
            _ => scores.to_vec(),
        };

        let candidate_idx: Vec<usize> = if self.topk_method == "noaux_tc" && self.n_group > 1 {
            let group_size = num_experts / self.n_group;
            let mut group_scores: Vec<(usize, f32)> = (0..self.n_group)
                .map(|g| {
                    let start = g * group_size;
                    let mut group = biased[start..start + group_size].to_vec();
                    group.sort_by(|a, b| b.partial_cmp(a).unwrap());
                    let top2_sum: f32 = group.iter().take(2).sum();
                    (g, top2_sum)
                })
                .collect();
            group_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
            let chosen_groups: Vec<usize> = group_scores.into_iter().take(self.topk_group).map(|(g, _)| g).collect();
            (0..num_experts).filter(|i| chosen_groups.contains(&(i / group_size))).collect()
        } else {
            (0..num_experts).collect()
        };

        let mut ranked: Vec<(usize, f32)> = candidate_idx.iter().map(|&i| (i, biased[i])).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let top = ranked.into_iter().take(self.num_experts_per_tok);

        // Weights returned are the uncorrected scores at the selected
        // indices — the correction bias only affects selection, and there is
        // no renormalization over the chosen set.
        top.map(|(i, _)| (i, scores[i])).collect()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, h) = x.dims3()?;
        let flat = x.reshape((b * s, h))?;
        let num_experts = self.experts.gate_proj.dim(0)?;

        let logits = self.gate.forward(&flat)?; // (tokens, num_experts)
        let probs = if self.scoring_func == "sigmoid" {
            candle_nn::ops::sigmoid(&logits)?
        } else {
            candle_nn::ops::softmax_last_dim(&logits)?
        };
        let probs_f32 = probs.to_dtype(DType::F32)?;

        let num_tokens = flat.dim(0)?;
        let mut outputs = Vec::with_capacity(num_tokens);
        for t in 0..num_tokens {
            let token_x = flat.narrow(0, t, 1)?;
            let scores = probs_f32.get(t)?.to_vec1::<f32>()?;
            let routed = self.route(&scores, num_experts);

            let mut acc: Option<Tensor> = None;
            for (expert, weight) in routed {
                let out = (self.experts.forward_one(expert, &token_x)? * (weight as f64 * self.routed_scaling_factor))?;
                acc = Some(match acc {
                    Some(a) => (a + out)?,
                    None => out,
                });
            }
            let mut acc = acc.ok_or_else(|| candle_core::Error::Msg("empty expert selection".into()))?;
            if let Some(shared) = &self.shared_experts {
                acc = (acc + shared.forward(&token_x)?)?;
            }
            outputs.push(acc);
        }

        let stacked = Tensor::cat(&outputs, 0)?;
        stacked.reshape((b, s, h))
    }
}

/// A decoder layer's feed-forward sublayer: dense for the first
/// `first_k_dense_replace` layers, MoE afterwards.
#[derive(Debug)]
pub enum FeedForward {
    Dense(Mlp),
    Moe(Box<MoeBlock>),
}

impl FeedForward {
    pub fn new(cfg: &LanguageConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        if layer_idx < cfg.first_k_dense_replace {
            Ok(Self::Dense(Mlp::new(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp"))?))
        } else {
            Ok(Self::Moe(Box::new(MoeBlock::new(cfg, vb.pp("mlp"))?)))
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(m) => m.forward(x),
            Self::Moe(m) => m.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(topk_method: &str, n_group: usize, topk_group: usize) -> MoeBlock {
        let weight = Tensor::zeros((1, 1), DType::F32, &candle_core::Device::Cpu).unwrap();
        MoeBlock {
            gate: Linear::new(weight, None),
            score_correction_bias: None,
            experts: RoutedExperts {
                gate_proj: Tensor::zeros((4, 1, 1), DType::F32, &candle_core::Device::Cpu).unwrap(),
                up_proj: Tensor::zeros((4, 1, 1), DType::F32, &candle_core::Device::Cpu).unwrap(),
                down_proj: Tensor::zeros((4, 1, 1), DType::F32, &candle_core::Device::Cpu).unwrap(),
            },
            shared_experts: None,
            num_experts_per_tok: 2,
            n_group,
            topk_group,
            topk_method: topk_method.to_string(),
            routed_scaling_factor: 1.0,
            scoring_func: "softmax".to_string(),
        }
    }

    #[test]
    fn greedy_routing_picks_top_k() {
        let block = make_block("greedy", 1, 1);
        let scores = vec![0.1, 0.4, 0.2, 0.3];
        let routed = block.route(&scores, 4);
        assert_eq!(routed.len(), 2);
        let picked: Vec<usize> = routed.iter().map(|(i, _)| *i).collect();
        assert!(picked.contains(&1));
        assert!(picked.contains(&3));
        // weights are the raw uncorrected scores at the selected indices,
        // not renormalized to sum to 1.
        for (idx, weight) in &routed {
            assert_eq!(*weight, scores[*idx]);
        }
    }

    #[test]
    fn group_constrained_routing_respects_group_limit() {
        let block = make_block("noaux_tc", 2, 1);
        // group 0 = experts [0,1], group 1 = experts [2,3]; group 1 has the
        // higher max score so only experts 2/3 should be eligible.
        let scores = vec![0.1, 0.2, 0.9, 0.8];
        let routed = block.route(&scores, 4);
        assert_eq!(routed.len(), 2);
        for (idx, _) in routed {
            assert!(idx == 2 || idx == 3);
        }
    }
}
