//! Local DeepSeek-OCR inference engine: a candle-based tensor runtime,
//! weight loader, custom SAM+CLIP vision stack, DeepSeek-V2 MoE decoder, and
//! the preprocessing/generation/postprocessing glue that turns an image into
//! grounded OCR markdown.

pub mod config;
pub mod error;
pub mod generation;
pub mod language;
pub mod layers;
pub mod loader;
pub mod model;
pub mod postprocess;
pub mod preprocessor;
pub mod vision;
pub mod weights;

pub use config::DeepSeekOcrConfig;
pub use error::{OcrError, Result};
pub use generation::{generate, GenerationConfig, GenerationResult};
pub use loader::{load_from_hub, load_local, LoadedModel};
pub use model::DeepSeekOcrForCausalLM;
pub use preprocessor::Preprocessor;

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info`. Mirrors the teacher's own CLI logging setup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
