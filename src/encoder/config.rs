use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// How position ids are derived from `input_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionScheme {
    /// `0..seq` for every row (BERT).
    Absolute,
    /// Cumulative count of non-pad tokens offset by the pad id; pads keep the
    /// pad id itself (RoBERTa, XLM-R).
    PaddingAware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    GeluErf,
    GeluTanh,
    Relu,
}

/// The subset of a Hugging Face `config.json` needed to rebuild the encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
}

fn default_model_type() -> String {
    "bert".to_string()
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl EncoderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(ExportError::io(path))?;
        let config: Self = serde_json::from_str(&text)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 || self.num_hidden_layers == 0 {
            return Err(ExportError::Unsupported(format!(
                "degenerate encoder: hidden_size={} heads={} layers={}",
                self.hidden_size, self.num_attention_heads, self.num_hidden_layers
            )));
        }
        if !self.hidden_size.is_multiple_of(self.num_attention_heads) {
            return Err(ExportError::Unsupported(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        self.activation()?;
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn position_scheme(&self) -> PositionScheme {
        match self.model_type.as_str() {
            "roberta" | "xlm-roberta" | "camembert" => PositionScheme::PaddingAware,
            _ => PositionScheme::Absolute,
        }
    }

    pub fn activation(&self) -> Result<Activation> {
        match self.hidden_act.as_str() {
            "gelu" => Ok(Activation::GeluErf),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            other => Err(ExportError::Unsupported(format!("hidden_act '{other}'"))),
        }
    }

    /// Longest sequence the position table can address.
    pub fn max_sequence_length(&self) -> usize {
        match self.position_scheme() {
            PositionScheme::Absolute => self.max_position_embeddings,
            PositionScheme::PaddingAware => self
                .max_position_embeddings
                .saturating_sub(self.pad_token_id as usize + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BGE_M3_CONFIG: &str = r#"{
        "architectures": ["XLMRobertaModel"],
        "attention_probs_dropout_prob": 0.1,
        "bos_token_id": 0,
        "eos_token_id": 2,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "hidden_size": 1024,
        "initializer_range": 0.02,
        "intermediate_size": 4096,
        "layer_norm_eps": 1e-05,
        "max_position_embeddings": 8194,
        "model_type": "xlm-roberta",
        "num_attention_heads": 16,
        "num_hidden_layers": 24,
        "output_past": true,
        "pad_token_id": 1,
        "position_embedding_type": "absolute",
        "torch_dtype": "float32",
        "type_vocab_size": 1,
        "use_cache": true,
        "vocab_size": 250002
    }"#;

    #[test]
    fn parses_bge_m3_config() {
        let config: EncoderConfig = serde_json::from_str(BGE_M3_CONFIG).expect("config parses");
        config.check().expect("config is supported");
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.position_scheme(), PositionScheme::PaddingAware);
        assert_eq!(config.activation().expect("gelu"), Activation::GeluErf);
        assert_eq!(config.max_sequence_length(), 8192);
    }

    #[test]
    fn bert_defaults_to_absolute_positions() {
        let config: EncoderConfig = serde_json::from_str(
            r#"{"vocab_size": 30522, "hidden_size": 384, "num_hidden_layers": 6,
                "num_attention_heads": 12, "intermediate_size": 1536,
                "max_position_embeddings": 512}"#,
        )
        .expect("config parses");
        assert_eq!(config.model_type, "bert");
        assert_eq!(config.type_vocab_size, 2);
        assert_eq!(config.position_scheme(), PositionScheme::Absolute);
        assert_eq!(config.max_sequence_length(), 512);
    }

    #[test]
    fn unknown_activation_is_unsupported() {
        let mut config: EncoderConfig = serde_json::from_str(BGE_M3_CONFIG).expect("config parses");
        config.hidden_act = "swish".to_string();
        assert!(matches!(config.check(), Err(ExportError::Unsupported(_))));
    }
}
