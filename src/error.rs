//! Error types for the export pipeline.

use std::fmt::Display;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors that can occur while exporting or verifying a dense encoder graph.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// An optional component was not compiled into this binary.
    #[error("{dependency} is required for {purpose}. {hint}")]
    DependencyMissing {
        dependency: &'static str,
        purpose: &'static str,
        hint: &'static str,
    },

    /// No save strategy produced the consolidated tokenizer file.
    #[error(
        "{} was not generated. Please ensure the model ships a fast tokenizer (tokenizer.json).",
        path.display()
    )]
    ArtifactMissing { path: PathBuf },

    /// A local model path or hub repository could not be resolved.
    #[error("model '{model_id}' could not be resolved: {detail}")]
    ModelNotFound { model_id: String, detail: String },

    #[error("invalid export configuration: {0}")]
    InvalidConfig(String),

    /// The checkpoint uses something the graph emitter cannot express.
    #[error("unsupported model feature: {0}")]
    Unsupported(String),

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("parity check failed: max_abs_error={max_abs_error:e} exceeds tolerance={tolerance:e}")]
    ParityExceeded { max_abs_error: f32, tolerance: f32 },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// An error raised by tokenizers, hf-hub or onnxruntime, kept as text.
    #[error("failed to {stage}: {message}")]
    Upstream { stage: &'static str, message: String },
}

impl ExportError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Wraps a third-party error whose type we do not carry through the API.
pub fn upstream<E: Display>(stage: &'static str) -> impl FnOnce(E) -> ExportError {
    move |err| ExportError::Upstream {
        stage,
        message: err.to_string(),
    }
}
