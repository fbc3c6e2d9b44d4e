//! Persisting the tokenizer next to the exported graph.
//!
//! Downstream consumers load `tokenizer.json` with the `tokenizers` crate, so
//! the consolidated file is the only acceptable end state. Strategies are
//! tried in order until one leaves that file in the output directory.

use std::fs;
use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::error::{ExportError, Result, upstream};
use crate::hub::{ModelFiles, TOKENIZER_FILE};

/// The tokenizer as resolved from the model repository.
pub struct TokenizerSource {
    fast: Option<Tokenizer>,
    legacy_files: Vec<PathBuf>,
}

impl TokenizerSource {
    pub fn new(fast: Option<Tokenizer>, legacy_files: Vec<PathBuf>) -> Self {
        Self { fast, legacy_files }
    }

    pub fn from_model_files(files: &ModelFiles) -> Result<Self> {
        let fast = match &files.tokenizer_json {
            Some(path) => Some(Tokenizer::from_file(path).map_err(upstream("load tokenizer"))?),
            None => None,
        };
        Ok(Self::new(fast, files.legacy_tokenizer_files.clone()))
    }

    pub fn fast(&self) -> Option<&Tokenizer> {
        self.fast.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Unsupported,
}

pub trait SaveStrategy {
    fn name(&self) -> &'static str;
    fn save(&self, source: &TokenizerSource, out_dir: &Path) -> Result<SaveOutcome>;
}

/// Serializes the fast backend straight to `tokenizer.json`.
pub struct FastBackendSave;

impl SaveStrategy for FastBackendSave {
    fn name(&self) -> &'static str {
        "fast-backend"
    }

    fn save(&self, source: &TokenizerSource, out_dir: &Path) -> Result<SaveOutcome> {
        let Some(tokenizer) = source.fast() else {
            return Ok(SaveOutcome::Unsupported);
        };
        tokenizer
            .save(out_dir.join(TOKENIZER_FILE), false)
            .map_err(upstream("save tokenizer.json"))?;
        Ok(SaveOutcome::Saved)
    }
}

/// Copies the multi-file descriptor set. Only counts as saved when the
/// consolidated file is present afterwards.
pub struct LegacyFileCopy;

impl SaveStrategy for LegacyFileCopy {
    fn name(&self) -> &'static str {
        "legacy-files"
    }

    fn save(&self, source: &TokenizerSource, out_dir: &Path) -> Result<SaveOutcome> {
        for file in &source.legacy_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = out_dir.join(name);
            fs::copy(file, &dest).map_err(ExportError::io(&dest))?;
            debug!(file = %dest.display(), "copied legacy tokenizer file");
        }
        if out_dir.join(TOKENIZER_FILE).is_file() {
            Ok(SaveOutcome::Saved)
        } else {
            Ok(SaveOutcome::Unsupported)
        }
    }
}

pub fn default_strategies() -> [&'static dyn SaveStrategy; 2] {
    [&FastBackendSave, &LegacyFileCopy]
}

#[derive(Debug, Clone)]
pub struct TokenizerArtifact {
    pub dir: PathBuf,
    pub tokenizer_json: PathBuf,
    pub strategy: &'static str,
}

pub fn persist(
    source: &TokenizerSource,
    out_dir: &Path,
    strategies: &[&dyn SaveStrategy],
) -> Result<TokenizerArtifact> {
    fs::create_dir_all(out_dir).map_err(ExportError::io(out_dir))?;
    let tokenizer_json = out_dir.join(TOKENIZER_FILE);

    for strategy in strategies {
        match strategy.save(source, out_dir)? {
            SaveOutcome::Saved => {
                return Ok(TokenizerArtifact {
                    dir: out_dir.to_path_buf(),
                    tokenizer_json,
                    strategy: strategy.name(),
                });
            }
            SaveOutcome::Unsupported => {
                warn!(strategy = strategy.name(), "tokenizer save strategy unavailable");
            }
        }
    }

    Err(ExportError::ArtifactMissing {
        path: tokenizer_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"<pad>": 0, "<unk>": 1, "hi": 2}, "unk_token": "<unk>"}
    }"#;

    fn fast_tokenizer() -> Tokenizer {
        WORD_LEVEL.parse().expect("tokenizer json should parse")
    }

    #[test]
    fn fast_backend_writes_consolidated_file() {
        let out = tempfile::tempdir().expect("tempdir");
        let source = TokenizerSource::new(Some(fast_tokenizer()), Vec::new());

        let artifact =
            persist(&source, out.path(), &default_strategies()).expect("fast save should succeed");
        assert_eq!(artifact.strategy, "fast-backend");
        assert!(artifact.tokenizer_json.is_file());
        let reloaded = Tokenizer::from_file(&artifact.tokenizer_json).expect("reload");
        assert_eq!(reloaded.token_to_id("hi"), Some(2));
    }

    #[test]
    fn legacy_only_source_is_artifact_missing() {
        let src = tempfile::tempdir().expect("tempdir");
        let spm = src.path().join("sentencepiece.bpe.model");
        fs::write(&spm, b"not really a model").expect("write legacy file");
        let out = tempfile::tempdir().expect("tempdir");

        let source = TokenizerSource::new(None, vec![spm]);
        let err = persist(&source, out.path(), &default_strategies())
            .expect_err("no tokenizer.json should be produced");
        assert!(matches!(err, ExportError::ArtifactMissing { .. }));
        assert!(out.path().join("sentencepiece.bpe.model").is_file());
    }

    #[test]
    fn legacy_copy_accepts_a_shipped_tokenizer_json() {
        let src = tempfile::tempdir().expect("tempdir");
        let shipped = src.path().join(TOKENIZER_FILE);
        fs::write(&shipped, WORD_LEVEL).expect("write tokenizer.json");
        let out = tempfile::tempdir().expect("tempdir");

        let source = TokenizerSource::new(None, vec![shipped]);
        let artifact = persist(&source, out.path(), &default_strategies())
            .expect("legacy copy should yield tokenizer.json");
        assert_eq!(artifact.strategy, "legacy-files");
    }
}
