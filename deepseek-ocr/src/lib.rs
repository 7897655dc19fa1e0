//! Thin facade re-exporting the engine crate's public surface, the way the
//! teacher's top-level crate sits in front of its own `-core` crate.

pub use deepseek_ocr_core::config::DeepSeekOcrConfig;
pub use deepseek_ocr_core::generation::{generate, GenerationConfig, GenerationResult};
pub use deepseek_ocr_core::loader::{load_from_hub, load_local, LoadedModel};
pub use deepseek_ocr_core::model::DeepSeekOcrForCausalLM;
pub use deepseek_ocr_core::postprocess::{self, Detection};
pub use deepseek_ocr_core::preprocessor::{Preprocessor, PreprocessorOutput, TokenType, VisionInput};
pub use deepseek_ocr_core::{init_tracing, OcrError, Result};

pub use candle_core::{DType, Device};
