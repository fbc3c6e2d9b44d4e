#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use dense_onnx_export::{ExportConfig, ExternalDataMode};

pub const HIDDEN: usize = 8;
pub const MAX_POSITIONS: usize = 40;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3, "hello": 4, "world": 5},
    "unk_token": "<unk>"
  }
}"#;

pub struct TinyModel {
    pub model_type: &'static str,
    pub with_tokenizer: bool,
    pub with_pooler: bool,
}

impl Default for TinyModel {
    fn default() -> Self {
        Self {
            model_type: "xlm-roberta",
            with_tokenizer: true,
            with_pooler: true,
        }
    }
}

impl TinyModel {
    /// Writes `config.json`, `model.safetensors` and optionally
    /// `tokenizer.json` under `dir` and returns the model directory.
    pub fn write(&self, dir: &Path) -> PathBuf {
        let model_dir = dir.join("tiny-model");
        fs::create_dir_all(&model_dir).expect("model dir");

        let type_vocab = if self.model_type == "bert" { 2 } else { 1 };
        let config = serde_json::json!({
            "model_type": self.model_type,
            "vocab_size": 16,
            "hidden_size": HIDDEN,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "hidden_act": "gelu",
            "max_position_embeddings": MAX_POSITIONS,
            "type_vocab_size": type_vocab,
            "layer_norm_eps": 1e-5,
            "pad_token_id": 1
        });
        fs::write(
            model_dir.join("config.json"),
            serde_json::to_string_pretty(&config).expect("config json"),
        )
        .expect("write config");

        let tensors = tiny_tensors(type_vocab, self.with_pooler);
        candle_core::safetensors::save(&tensors, model_dir.join("model.safetensors"))
            .expect("write safetensors");

        if self.with_tokenizer {
            fs::write(model_dir.join("tokenizer.json"), TOKENIZER_JSON).expect("write tokenizer");
        }
        model_dir
    }
}

fn tiny_tensors(type_vocab: usize, with_pooler: bool) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    let mut add = |name: String, shape: &[usize]| {
        let tensor = Tensor::randn(0f32, 0.2, shape, &device).expect("random tensor");
        tensors.insert(name, tensor);
    };

    add("embeddings.word_embeddings.weight".into(), &[16, HIDDEN]);
    add("embeddings.position_embeddings.weight".into(), &[MAX_POSITIONS, HIDDEN]);
    add("embeddings.token_type_embeddings.weight".into(), &[type_vocab, HIDDEN]);
    add("embeddings.LayerNorm.weight".into(), &[HIDDEN]);
    add("embeddings.LayerNorm.bias".into(), &[HIDDEN]);
    for layer in 0..2 {
        let base = format!("encoder.layer.{layer}");
        for (key, out_dim, in_dim) in [
            ("attention.self.query", HIDDEN, HIDDEN),
            ("attention.self.key", HIDDEN, HIDDEN),
            ("attention.self.value", HIDDEN, HIDDEN),
            ("attention.output.dense", HIDDEN, HIDDEN),
            ("intermediate.dense", 16, HIDDEN),
            ("output.dense", HIDDEN, 16),
        ] {
            add(format!("{base}.{key}.weight"), &[out_dim, in_dim]);
            add(format!("{base}.{key}.bias"), &[out_dim]);
        }
        for key in ["attention.output.LayerNorm", "output.LayerNorm"] {
            add(format!("{base}.{key}.weight"), &[HIDDEN]);
            add(format!("{base}.{key}.bias"), &[HIDDEN]);
        }
    }
    if with_pooler {
        add("pooler.dense.weight".into(), &[HIDDEN, HIDDEN]);
        add("pooler.dense.bias".into(), &[HIDDEN]);
    }
    tensors
}

pub fn config_for(model_dir: &Path, out_dir: &Path) -> ExportConfig {
    ExportConfig {
        model_id: model_dir.display().to_string(),
        out_dir: out_dir.to_path_buf(),
        max_length: 12,
        external_data: ExternalDataMode::Auto,
        ..ExportConfig::default()
    }
}
