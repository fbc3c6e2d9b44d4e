//! Narrowing an encoder to the single tensor the exported graph returns.

use candle_core::Tensor;

use crate::encoder::{EncoderModel, GraphInputs};
use crate::error::Result;
use crate::onnx::graph::GraphBuilder;
use crate::probe::TokenizedBatch;

/// A model view with exactly one output, renderable both as a candle forward
/// pass and as ONNX nodes.
pub trait ForwardAdapter {
    /// Name of the single graph output.
    fn output_name(&self) -> &'static str;

    fn forward(&self, batch: &TokenizedBatch) -> Result<Tensor>;

    /// Emits the nodes and returns the value that becomes the graph output.
    fn trace(&self, builder: &mut GraphBuilder, inputs: &GraphInputs) -> Result<String>;
}

/// Returns only `last_hidden_state`; the pooler head is never exported.
pub struct LastHiddenState<'a> {
    model: &'a EncoderModel,
}

impl<'a> LastHiddenState<'a> {
    pub fn new(model: &'a EncoderModel) -> Self {
        Self { model }
    }
}

impl ForwardAdapter for LastHiddenState<'_> {
    fn output_name(&self) -> &'static str {
        crate::LAST_HIDDEN_STATE
    }

    fn forward(&self, batch: &TokenizedBatch) -> Result<Tensor> {
        Ok(self.model.forward(batch)?.last_hidden_state)
    }

    fn trace(&self, builder: &mut GraphBuilder, inputs: &GraphInputs) -> Result<String> {
        Ok(self.model.trace(builder, inputs)?.last_hidden_state)
    }
}
