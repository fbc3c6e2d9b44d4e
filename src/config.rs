use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

pub const DEFAULT_MODEL_ID: &str = "BAAI/bge-m3";
pub const DEFAULT_OUT_DIR: &str = "data/model";
pub const DEFAULT_OPSET: i64 = 17;
pub const DEFAULT_MAX_LENGTH: usize = 32;
pub const DEFAULT_REVISION: &str = "main";

/// Opsets the graph emitter knows how to target.
pub const SUPPORTED_OPSETS: std::ops::RangeInclusive<i64> = 13..=21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    pub fn to_candle(self) -> candle_core::Device {
        match self {
            Self::Cpu => candle_core::Device::Cpu,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// Where initializer payloads end up in the written model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExternalDataMode {
    /// Move weights to a sidecar only when the protobuf would be too large.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub model_id: String,
    pub out_dir: PathBuf,
    pub opset: i64,
    pub max_length: usize,
    pub verify: bool,
    pub device: Device,
    pub revision: String,
    pub cache_dir: Option<PathBuf>,
    pub constant_folding: bool,
    pub external_data: ExternalDataMode,
    pub max_abs_tolerance: Option<f32>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            opset: DEFAULT_OPSET,
            max_length: DEFAULT_MAX_LENGTH,
            verify: false,
            device: Device::Cpu,
            revision: DEFAULT_REVISION.to_string(),
            cache_dir: None,
            constant_folding: true,
            external_data: ExternalDataMode::Auto,
            max_abs_tolerance: None,
        }
    }
}

impl ExportConfig {
    pub fn validate(self) -> Result<Self> {
        if self.model_id.trim().is_empty() {
            return Err(ExportError::InvalidConfig(
                "model id must not be empty".to_string(),
            ));
        }
        if self.max_length == 0 {
            return Err(ExportError::InvalidConfig(
                "max_length must be > 0".to_string(),
            ));
        }
        if !SUPPORTED_OPSETS.contains(&self.opset) {
            return Err(ExportError::InvalidConfig(format!(
                "opset {} is outside the supported range {}..={}",
                self.opset,
                SUPPORTED_OPSETS.start(),
                SUPPORTED_OPSETS.end()
            )));
        }
        if let Some(tolerance) = self.max_abs_tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(ExportError::InvalidConfig(format!(
                    "max_abs_tolerance must be a non-negative finite number, got {tolerance}"
                )));
            }
            if !self.verify {
                return Err(ExportError::InvalidConfig(
                    "max_abs_tolerance requires --verify".to_string(),
                ));
            }
        }
        Ok(self)
    }
}
