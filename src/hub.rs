//! Model file resolution from a local directory or the Hugging Face Hub.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::error::{ExportError, Result, upstream};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
const PICKLE_FILE: &str = "pytorch_model.bin";

/// Descriptor files a slow tokenizer is reconstructed from.
pub const LEGACY_TOKENIZER_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "added_tokens.json",
    "sentencepiece.bpe.model",
    "spiece.model",
    "vocab.txt",
    "vocab.json",
    "merges.txt",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightLayout {
    Safetensors,
    ShardedSafetensors,
    Pickle,
}

#[derive(Debug, Clone)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pickle(PathBuf),
}

/// Everything the pipeline needs from a model repository, already on disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub model_id: String,
    pub revision: String,
    pub config: PathBuf,
    pub weights: WeightFiles,
    pub tokenizer_json: Option<PathBuf>,
    pub legacy_tokenizer_files: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

pub fn resolve(config: &ExportConfig) -> Result<ModelFiles> {
    let local = Path::new(&config.model_id);
    if local.is_dir() {
        return resolve_local(&config.model_id, local);
    }
    if looks_like_path(&config.model_id) {
        return Err(ExportError::ModelNotFound {
            model_id: config.model_id.clone(),
            detail: "no such local directory".to_string(),
        });
    }
    resolve_hub(config)
}

fn looks_like_path(model_id: &str) -> bool {
    model_id.starts_with('.')
        || model_id.starts_with('/')
        || model_id.starts_with('~')
        || model_id.contains('\\')
        || model_id.matches('/').count() > 1
}

/// Picks the weight layout from a repository listing, preferring safetensors.
pub fn select_weights(available: &[String]) -> Option<WeightLayout> {
    let has = |name: &str| available.iter().any(|f| f == name);
    if has(SAFETENSORS_FILE) {
        Some(WeightLayout::Safetensors)
    } else if has(SAFETENSORS_INDEX_FILE) {
        Some(WeightLayout::ShardedSafetensors)
    } else if has(PICKLE_FILE) {
        Some(WeightLayout::Pickle)
    } else {
        None
    }
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(index_path).map_err(ExportError::io(index_path))?;
    let index: SafetensorsIndex = serde_json::from_str(&text)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

fn resolve_local(model_id: &str, dir: &Path) -> Result<ModelFiles> {
    let available: Vec<String> = fs::read_dir(dir)
        .map_err(ExportError::io(dir))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    let config = dir.join(CONFIG_FILE);
    if !config.is_file() {
        return Err(ExportError::ModelNotFound {
            model_id: model_id.to_string(),
            detail: format!("{} is missing", config.display()),
        });
    }

    let weights = match select_weights(&available) {
        Some(WeightLayout::Safetensors) => WeightFiles::Safetensors(vec![dir.join(SAFETENSORS_FILE)]),
        Some(WeightLayout::ShardedSafetensors) => {
            let shards = shard_names(&dir.join(SAFETENSORS_INDEX_FILE))?;
            WeightFiles::Safetensors(shards.iter().map(|s| dir.join(s)).collect())
        }
        Some(WeightLayout::Pickle) => WeightFiles::Pickle(dir.join(PICKLE_FILE)),
        None => {
            return Err(ExportError::ModelNotFound {
                model_id: model_id.to_string(),
                detail: format!("no model weights found under {}", dir.display()),
            });
        }
    };

    let tokenizer_json = Some(dir.join(TOKENIZER_FILE)).filter(|p| p.is_file());
    let legacy_tokenizer_files = LEGACY_TOKENIZER_FILES
        .iter()
        .map(|name| dir.join(name))
        .filter(|p| p.is_file())
        .collect();

    debug!(dir = %dir.display(), "resolved local model directory");
    Ok(ModelFiles {
        model_id: model_id.to_string(),
        revision: "local".to_string(),
        config,
        weights,
        tokenizer_json,
        legacy_tokenizer_files,
    })
}

/// Token from `HF_TOKEN`. Without it, `ApiBuilder::new()` keeps whatever token
/// hf-hub finds in its own cache.
fn resolve_token() -> Option<String> {
    std::env::var("HF_TOKEN")
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn resolve_hub(config: &ExportConfig) -> Result<ModelFiles> {
    let mut builder = ApiBuilder::new().with_progress(false);
    if let Some(cache_dir) = &config.cache_dir {
        builder = builder.with_cache_dir(cache_dir.clone());
    }
    if let Some(token) = resolve_token() {
        builder = builder.with_token(Some(token));
    }
    let api = builder.build().map_err(upstream("initialize hub client"))?;
    let repo = api.repo(Repo::with_revision(
        config.model_id.clone(),
        RepoType::Model,
        config.revision.clone(),
    ));

    let listing = repo.info().map_err(|e| ExportError::ModelNotFound {
        model_id: config.model_id.clone(),
        detail: e.to_string(),
    })?;
    let available: Vec<String> = listing.siblings.into_iter().map(|s| s.rfilename).collect();
    info!(model = %config.model_id, files = available.len(), "resolved hub repository");

    let fetch = |name: &str| -> Result<PathBuf> {
        debug!(file = name, "fetching from hub");
        repo.get(name).map_err(upstream("download model file"))
    };
    let fetch_optional = |name: &str| -> Result<Option<PathBuf>> {
        if available.iter().any(|f| f == name) {
            repo.get(name).map(Some).map_err(upstream("download tokenizer file"))
        } else {
            Ok(None)
        }
    };

    if !available.iter().any(|f| f == CONFIG_FILE) {
        return Err(ExportError::ModelNotFound {
            model_id: config.model_id.clone(),
            detail: format!("repository has no {CONFIG_FILE}"),
        });
    }
    let config_path = fetch(CONFIG_FILE)?;

    let weights = match select_weights(&available) {
        Some(WeightLayout::Safetensors) => WeightFiles::Safetensors(vec![fetch(SAFETENSORS_FILE)?]),
        Some(WeightLayout::ShardedSafetensors) => {
            let index = fetch(SAFETENSORS_INDEX_FILE)?;
            let shards = shard_names(&index)?
                .iter()
                .map(|name| fetch(name))
                .collect::<Result<Vec<_>>>()?;
            WeightFiles::Safetensors(shards)
        }
        Some(WeightLayout::Pickle) => WeightFiles::Pickle(fetch(PICKLE_FILE)?),
        None => {
            return Err(ExportError::ModelNotFound {
                model_id: config.model_id.clone(),
                detail: "repository has no supported weight files".to_string(),
            });
        }
    };

    let tokenizer_json = fetch_optional(TOKENIZER_FILE)?;
    let mut legacy_tokenizer_files = Vec::new();
    for name in LEGACY_TOKENIZER_FILES {
        if let Some(path) = fetch_optional(name)? {
            legacy_tokenizer_files.push(path);
        }
    }

    Ok(ModelFiles {
        model_id: config.model_id.clone(),
        revision: config.revision.clone(),
        config: config_path,
        weights,
        tokenizer_json,
        legacy_tokenizer_files,
    })
}
