//! BERT-family encoder rebuilt from checkpoint weights.
//!
//! The same weights drive two renderings: a candle forward pass used as the
//! numerical reference, and an ONNX trace that emits the equivalent graph.

pub mod config;
mod forward;
mod trace;
pub mod weights;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use tracing::info;

use crate::error::Result;
use crate::hub::ModelFiles;
use crate::onnx::graph::GraphBuilder;
use crate::probe::TokenizedBatch;

pub use config::{Activation, EncoderConfig, PositionScheme};
pub use forward::{MASKED_SCORE, position_ids};
pub use trace::GraphInputs;
pub use weights::EncoderWeights;

/// Full encoder outputs, mirroring the Hugging Face base model.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq, hidden]`
    pub last_hidden_state: Tensor,
    /// `[batch, hidden]`, present when the checkpoint carries a pooler.
    pub pooler_output: Option<Tensor>,
}

/// Graph value names of the traced encoder outputs.
#[derive(Debug, Clone)]
pub struct TracedOutput {
    pub last_hidden_state: String,
    pub pooler_output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EncoderModel {
    config: EncoderConfig,
    weights: EncoderWeights,
    device: Device,
}

impl EncoderModel {
    pub fn load(files: &ModelFiles, device: &Device) -> Result<Self> {
        let config = EncoderConfig::load(&files.config)?;
        let vb = weights::open_checkpoint(&files.weights, device)?;
        let model = Self::from_var_builder(vb, config)?;
        info!(
            model_type = %model.config.model_type,
            layers = model.config.num_hidden_layers,
            hidden = model.config.hidden_size,
            parameters = model.weights.parameter_count(),
            "encoder weights loaded"
        );
        Ok(model)
    }

    pub fn from_var_builder(vb: VarBuilder<'_>, config: EncoderConfig) -> Result<Self> {
        let device = vb.device().clone();
        let weights = EncoderWeights::load(vb, &config)?;
        Ok(Self {
            config,
            weights,
            device,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn weights(&self) -> &EncoderWeights {
        &self.weights
    }

    pub fn forward(&self, batch: &TokenizedBatch) -> Result<EncoderOutput> {
        let (input_ids, attention_mask, token_type_ids) = batch.to_tensors(&self.device)?;
        let output = forward::encoder_forward(
            &self.weights,
            &self.config,
            &input_ids,
            &attention_mask,
            &token_type_ids,
        )?;
        Ok(EncoderOutput {
            last_hidden_state: output.last_hidden_state,
            pooler_output: output.pooler_output,
        })
    }

    pub fn trace(&self, builder: &mut GraphBuilder, inputs: &GraphInputs) -> Result<TracedOutput> {
        let output = trace::encoder_trace(&self.weights, &self.config, builder, inputs)?;
        Ok(TracedOutput {
            last_hidden_state: output.last_hidden_state,
            pooler_output: output.pooler_output,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::tiny_model;
    use super::*;

    #[test]
    fn forward_produces_hidden_states_and_pooler() {
        let model = tiny_model();
        let batch = TokenizedBatch::new(vec![0, 5, 6, 2, 1, 1], vec![1, 1, 1, 1, 0, 0], vec![0; 6])
            .expect("batch");
        let output = model.forward(&batch).expect("forward");
        assert_eq!(output.last_hidden_state.dims(), &[1, 6, 8]);
        let pooler = output.pooler_output.expect("pooler present");
        assert_eq!(pooler.dims(), &[1, 8]);
    }

    #[test]
    fn padding_does_not_change_real_token_states() {
        let model = tiny_model();
        let short = TokenizedBatch::new(vec![0, 5, 2], vec![1, 1, 1], vec![0; 3]).expect("batch");
        let padded = TokenizedBatch::new(vec![0, 5, 2, 1, 1], vec![1, 1, 1, 0, 0], vec![0; 5])
            .expect("batch");
        let short = model.forward(&short).expect("forward").last_hidden_state;
        let padded = model
            .forward(&padded)
            .expect("forward")
            .last_hidden_state
            .narrow(1, 0, 3)
            .expect("narrow");
        let diff = (short - padded)
            .expect("sub")
            .abs()
            .expect("abs")
            .flatten_all()
            .expect("flatten")
            .max(0)
            .expect("max")
            .to_scalar::<f32>()
            .expect("scalar");
        assert!(diff < 1e-5, "padded keys leaked into attention: {diff}");
    }

    #[test]
    fn checkpoint_without_pooler_loads() {
        let config = fixture::tiny_config();
        let tensors = fixture::tiny_tensors(&config, false);
        let vb = VarBuilder::from_tensors(tensors, candle_core::DType::F32, &Device::Cpu);
        let model = EncoderModel::from_var_builder(vb, config).expect("model");
        assert!(model.weights().pooler.is_none());
    }

    #[test]
    fn missing_embeddings_are_unsupported() {
        let vb = VarBuilder::from_tensors(
            std::collections::HashMap::new(),
            candle_core::DType::F32,
            &Device::Cpu,
        );
        let err = EncoderModel::from_var_builder(vb, fixture::tiny_config()).expect_err("no weights");
        assert!(matches!(err, crate::error::ExportError::Unsupported(_)));
    }
}
