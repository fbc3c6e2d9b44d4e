//! Loading encoder weights from safetensors or PyTorch checkpoints.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::error::{ExportError, Result};
use crate::hub::WeightFiles;

use super::config::EncoderConfig;

/// Prefixes under which task-head checkpoints nest the base encoder.
const MODEL_PREFIXES: &[&str] = &["", "roberta", "bert", "model"];

/// A named weight. The name is reused for the graph initializer.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub tensor: Tensor,
}

#[derive(Debug, Clone)]
pub struct LinearWeights {
    /// `[out_features, in_features]`
    pub weight: Param,
    pub bias: Param,
}

#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub weight: Param,
    pub bias: Param,
}

#[derive(Debug, Clone)]
pub struct EmbeddingWeights {
    pub word: Param,
    pub position: Param,
    pub token_type: Param,
    pub layer_norm: LayerNormWeights,
}

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub query: LinearWeights,
    pub key: LinearWeights,
    pub value: LinearWeights,
    pub attention_output: LinearWeights,
    pub attention_norm: LayerNormWeights,
    pub intermediate: LinearWeights,
    pub output: LinearWeights,
    pub output_norm: LayerNormWeights,
}

#[derive(Debug, Clone)]
pub struct EncoderWeights {
    pub embeddings: EmbeddingWeights,
    pub layers: Vec<LayerWeights>,
    pub pooler: Option<LinearWeights>,
}

/// Opens the checkpoint as an f32 `VarBuilder`.
pub fn open_checkpoint(files: &WeightFiles, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = match files {
        WeightFiles::Safetensors(paths) => {
            // SAFETY: the mapped files are hub/cache artifacts that are not
            // modified while the export runs.
            unsafe { VarBuilder::from_mmaped_safetensors(paths.as_slice(), DType::F32, device)? }
        }
        WeightFiles::Pickle(path) => VarBuilder::from_pth(path, DType::F32, device)?,
    };
    Ok(vb)
}

struct Loader<'a> {
    vb: VarBuilder<'a>,
    prefix: &'static str,
}

impl Loader<'_> {
    fn name(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.prefix)
        }
    }

    fn param<S: Into<candle_core::Shape>>(&self, shape: S, key: &str) -> Result<Param> {
        let name = self.name(key);
        let tensor = self.vb.get(shape, &name)?;
        Ok(Param { name, tensor })
    }

    fn linear(&self, key: &str, in_dim: usize, out_dim: usize) -> Result<LinearWeights> {
        Ok(LinearWeights {
            weight: self.param((out_dim, in_dim), &format!("{key}.weight"))?,
            bias: self.param(out_dim, &format!("{key}.bias"))?,
        })
    }

    fn layer_norm(&self, key: &str, dim: usize) -> Result<LayerNormWeights> {
        Ok(LayerNormWeights {
            weight: self.param(dim, &format!("{key}.weight"))?,
            bias: self.param(dim, &format!("{key}.bias"))?,
        })
    }
}

impl EncoderWeights {
    pub fn load(vb: VarBuilder<'_>, config: &EncoderConfig) -> Result<Self> {
        let prefix = MODEL_PREFIXES
            .iter()
            .copied()
            .find(|prefix| {
                let key = if prefix.is_empty() {
                    "embeddings.word_embeddings.weight".to_string()
                } else {
                    format!("{prefix}.embeddings.word_embeddings.weight")
                };
                vb.contains_tensor(&key)
            })
            .ok_or_else(|| {
                ExportError::Unsupported(
                    "checkpoint has no embeddings.word_embeddings.weight tensor".to_string(),
                )
            })?;
        debug!(prefix, "located encoder weights");

        let loader = Loader { vb, prefix };
        let hidden = config.hidden_size;

        let embeddings = EmbeddingWeights {
            word: loader.param((config.vocab_size, hidden), "embeddings.word_embeddings.weight")?,
            position: loader.param(
                (config.max_position_embeddings, hidden),
                "embeddings.position_embeddings.weight",
            )?,
            token_type: loader.param(
                (config.type_vocab_size, hidden),
                "embeddings.token_type_embeddings.weight",
            )?,
            layer_norm: loader.layer_norm("embeddings.LayerNorm", hidden)?,
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for index in 0..config.num_hidden_layers {
            let base = format!("encoder.layer.{index}");
            layers.push(LayerWeights {
                query: loader.linear(&format!("{base}.attention.self.query"), hidden, hidden)?,
                key: loader.linear(&format!("{base}.attention.self.key"), hidden, hidden)?,
                value: loader.linear(&format!("{base}.attention.self.value"), hidden, hidden)?,
                attention_output: loader.linear(
                    &format!("{base}.attention.output.dense"),
                    hidden,
                    hidden,
                )?,
                attention_norm: loader
                    .layer_norm(&format!("{base}.attention.output.LayerNorm"), hidden)?,
                intermediate: loader.linear(
                    &format!("{base}.intermediate.dense"),
                    hidden,
                    config.intermediate_size,
                )?,
                output: loader.linear(
                    &format!("{base}.output.dense"),
                    config.intermediate_size,
                    hidden,
                )?,
                output_norm: loader.layer_norm(&format!("{base}.output.LayerNorm"), hidden)?,
            });
        }

        let pooler = if loader.vb.contains_tensor(&loader.name("pooler.dense.weight")) {
            Some(loader.linear("pooler.dense", hidden, hidden)?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            layers,
            pooler,
        })
    }

    pub fn parameter_count(&self) -> usize {
        let linear = |l: &LinearWeights| l.weight.tensor.elem_count() + l.bias.tensor.elem_count();
        let norm = |n: &LayerNormWeights| n.weight.tensor.elem_count() + n.bias.tensor.elem_count();
        let e = &self.embeddings;
        let mut total = e.word.tensor.elem_count()
            + e.position.tensor.elem_count()
            + e.token_type.tensor.elem_count()
            + norm(&e.layer_norm);
        for layer in &self.layers {
            total += linear(&layer.query)
                + linear(&layer.key)
                + linear(&layer.value)
                + linear(&layer.attention_output)
                + norm(&layer.attention_norm)
                + linear(&layer.intermediate)
                + linear(&layer.output)
                + norm(&layer.output_norm);
        }
        total + self.pooler.as_ref().map(linear).unwrap_or(0)
    }
}
