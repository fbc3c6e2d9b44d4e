//! End-to-end export: resolve, persist tokenizer, trace, write, verify.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::adapter::{ForwardAdapter, LastHiddenState};
use crate::config::ExportConfig;
use crate::encoder::EncoderModel;
use crate::error::{ExportError, Result, upstream};
use crate::hub::{self, TOKENIZER_FILE};
use crate::onnx::{self, ExportedGraph, GraphExportOptions};
use crate::probe::{PROBE_TEXT, TokenizedBatch};
use crate::tokenizer_artifact::{self, TokenizerArtifact, TokenizerSource};
use crate::verify::{self, VerifyReport};

pub const ONNX_FILENAME: &str = "bge-m3.onnx";
pub const MANIFEST_FILENAME: &str = "embedder_config.json";

/// Runtime hints for consumers of the exported graph, which returns token
/// states only. Pooling and normalisation happen in application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub max_length: usize,
    pub pooling: String,
    pub normalize: bool,
    pub hidden_size: usize,
    pub onnx_file: String,
    pub tokenizer_file: String,
    pub opset: i64,
    pub source_model: String,
}

impl ExportManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(ExportError::io(path))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(ExportError::io(path))
    }
}

#[derive(Debug, Clone)]
pub struct ExportArtifacts {
    pub graph: ExportedGraph,
    pub tokenizer: TokenizerArtifact,
    pub manifest: PathBuf,
    pub verify: Option<VerifyReport>,
}

pub struct ExportPipeline {
    config: ExportConfig,
}

impl ExportPipeline {
    pub fn new(config: ExportConfig) -> Result<Self> {
        Ok(Self {
            config: config.validate()?,
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Runs the export, printing progress lines to stdout.
    pub fn run(&self) -> Result<ExportArtifacts> {
        self.run_with_output(&mut io::stdout().lock())
    }

    /// Runs the export, writing `[export]` progress lines to `out`. The
    /// `[export] done` line follows the manifest; any `[verify]` line and the
    /// tolerance gate come after it.
    pub fn run_with_output(&self, out: &mut dyn Write) -> Result<ExportArtifacts> {
        let config = &self.config;
        let out_dir = &config.out_dir;

        progress(out, format_args!("[export] model={}", config.model_id))?;
        progress(out, format_args!("[export] out_dir={}", out_dir.display()))?;
        debug!(revision = %config.revision, "resolving model");
        let files = hub::resolve(config)?;
        let source = TokenizerSource::from_model_files(&files)?;

        let tokenizer = tokenizer_artifact::persist(
            &source,
            out_dir,
            &tokenizer_artifact::default_strategies(),
        )?;
        progress(
            out,
            format_args!(
                "[export] tokenizer saved to {} via {}",
                tokenizer.tokenizer_json.display(),
                tokenizer.strategy
            ),
        )?;

        let device = config.device.to_candle();
        let model = EncoderModel::load(&files, &device)?;
        let limit = model.config().max_sequence_length();
        if config.max_length > limit {
            return Err(ExportError::InvalidConfig(format!(
                "max_length {} exceeds the {limit} positions the encoder supports",
                config.max_length
            )));
        }
        let adapter = LastHiddenState::new(&model);

        let saved_tokenizer =
            Tokenizer::from_file(&tokenizer.tokenizer_json).map_err(upstream("load saved tokenizer"))?;
        let example = TokenizedBatch::encode(
            &saved_tokenizer,
            PROBE_TEXT,
            config.max_length,
            model.config().pad_token_id,
        )?;
        debug!(input_ids = ?example.input_ids, "example tokenized");

        let onnx_path = out_dir.join(ONNX_FILENAME);
        let options = GraphExportOptions {
            opset: config.opset,
            constant_folding: config.constant_folding,
            external_data: config.external_data,
            metadata: vec![
                ("source_model".to_string(), files.model_id.clone()),
                ("source_revision".to_string(), files.revision.clone()),
            ],
        };
        let graph = onnx::export_graph(&adapter, &example, &options, &onnx_path)?;
        progress(
            out,
            format_args!(
                "[export] wrote {} (opset {}, {} nodes, {} initializers)",
                graph.path.display(),
                graph.opset,
                graph.node_count,
                graph.initializer_count
            ),
        )?;
        if let Some(data) = &graph.external_data {
            progress(out, format_args!("[export] external weights in {}", data.display()))?;
        }

        let manifest = ExportManifest {
            max_length: config.max_length,
            pooling: "cls".to_string(),
            normalize: true,
            hidden_size: graph.hidden_size,
            onnx_file: ONNX_FILENAME.to_string(),
            tokenizer_file: TOKENIZER_FILE.to_string(),
            opset: graph.opset,
            source_model: files.model_id.clone(),
        };
        let manifest_path = out_dir.join(MANIFEST_FILENAME);
        manifest.write(&manifest_path)?;
        info!(path = %manifest_path.display(), "manifest written");
        progress(out, format_args!("[export] done"))?;

        let verify = if config.verify {
            let reference = adapter.forward(&example)?;
            let report = verify::verify_parity(
                &graph.path,
                &example,
                &reference,
                config.max_abs_tolerance,
            )?;
            progress(out, format_args!("{report}"))?;
            Some(report.enforce()?)
        } else {
            None
        };

        Ok(ExportArtifacts {
            graph,
            tokenizer,
            manifest: manifest_path,
            verify,
        })
    }
}

fn progress(out: &mut dyn Write, line: fmt::Arguments<'_>) -> Result<()> {
    writeln!(out, "{line}").map_err(upstream("write progress output"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = ExportConfig {
            max_length: 0,
            ..ExportConfig::default()
        };
        assert!(matches!(
            ExportPipeline::new(config),
            Err(ExportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(MANIFEST_FILENAME);
        let manifest = ExportManifest {
            max_length: 32,
            pooling: "cls".to_string(),
            normalize: true,
            hidden_size: 1024,
            onnx_file: ONNX_FILENAME.to_string(),
            tokenizer_file: TOKENIZER_FILE.to_string(),
            opset: 17,
            source_model: "BAAI/bge-m3".to_string(),
        };
        manifest.write(&path).expect("write");
        assert_eq!(ExportManifest::load(&path).expect("load"), manifest);
    }
}
