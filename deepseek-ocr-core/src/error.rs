//! Error types for the engine, grouped the way the teacher groups pipeline
//! errors: one enum per concern, `thiserror`-derived, with `anyhow` used only
//! at the CLI/demo boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("weight loading error: {0}")]
    Weight(String),

    #[error("invalid input: {0}")]
    Input(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, OcrError>;
