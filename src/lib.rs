//! Export BERT-family embedding encoders (BAAI/bge-m3 by default) to a single
//! ONNX graph returning `last_hidden_state`, and check it against ONNX Runtime.

pub mod adapter;
pub mod config;
pub mod encoder;
pub mod error;
pub mod hub;
pub mod onnx;
pub mod pipeline;
pub mod probe;
pub mod tokenizer_artifact;
pub mod verify;

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";
pub const LAST_HIDDEN_STATE: &str = "last_hidden_state";

pub use adapter::{ForwardAdapter, LastHiddenState};
pub use config::{Device, ExportConfig, ExternalDataMode};
pub use error::{ExportError, Result};
pub use pipeline::{ExportArtifacts, ExportManifest, ExportPipeline, MANIFEST_FILENAME, ONNX_FILENAME};
pub use verify::VerifyReport;
