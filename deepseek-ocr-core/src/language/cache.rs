//! Per-layer KV cache with a monotonically increasing offset, the position
//! base for rotary embeddings and the narrow-index into cached sin/cos
//! tables. Grounded on the `DynamicCache`/`PromptCacheGuard` pattern used by
//! the existing Rust DeepSeek-OCR decoder port.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Default)]
struct LayerCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl LayerCache {
    fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match (&self.k, &self.v) {
            (Some(prev_k), Some(prev_v)) => {
                (Tensor::cat(&[prev_k, k], 2)?, Tensor::cat(&[prev_v, v], 2)?)
            }
            _ => (k.clone(), v.clone()),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }
}

/// One `LayerCache` per decoder layer plus the shared sequence offset used to
/// index rotary position tables.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
    offset: usize,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self { layers: vec![LayerCache::default(); num_layers], offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Appends this step's `(k, v)` for `layer` and returns the full
    /// accumulated keys/values to attend over.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        self.layers[layer].append(k, v)
    }

    /// Advances the shared offset once all layers have been updated for this
    /// forward step; call after the last layer's `append`.
    pub fn advance(&mut self, seq_len: usize) {
        self.offset += seq_len;
    }
}
