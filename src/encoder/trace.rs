//! ONNX emission of the encoder, node for node with `forward.rs`.

use std::f32::consts::{FRAC_2_SQRT_PI, SQRT_2};

use crate::error::{ExportError, Result};
use crate::onnx::graph::{Attribute, ElemType, GraphBuilder, Initializer, TensorData};

use super::config::{Activation, EncoderConfig, PositionScheme};
use super::forward::MASKED_SCORE;
use super::weights::{EncoderWeights, LayerNormWeights, LayerWeights, LinearWeights, Param};

/// Names of the graph inputs the encoder reads.
#[derive(Debug, Clone)]
pub struct GraphInputs {
    pub input_ids: String,
    pub attention_mask: String,
    pub token_type_ids: String,
}

pub(super) struct TraceOutput {
    pub last_hidden_state: String,
    pub pooler_output: Option<String>,
}

pub(super) fn encoder_trace(
    weights: &EncoderWeights,
    config: &EncoderConfig,
    b: &mut GraphBuilder,
    inputs: &GraphInputs,
) -> Result<TraceOutput> {
    let activation = config.activation()?;

    let mut hidden_states = b.scoped("embeddings", |b| embeddings(b, weights, config, inputs))?;
    let mask = b.scoped("encoder", |b| extended_attention_mask(b, &inputs.attention_mask))?;
    for (index, layer) in weights.layers.iter().enumerate() {
        let scope = format!("encoder/layer.{index}");
        hidden_states = b.scoped(&scope, |b| {
            layer_trace(b, &hidden_states, layer, &mask, config, activation)
        })?;
    }

    let pooler_output = match &weights.pooler {
        Some(pooler) => Some(b.scoped("pooler", |b| {
            let index = b.constant_i64_scalar(0);
            let first = b.op(
                "Gather",
                &[&hidden_states, &index],
                vec![Attribute::int("axis", 1)],
            );
            let dense = linear(b, &first, pooler)?;
            Ok(b.op("Tanh", &[&dense], Vec::new()))
        })?),
        None => None,
    };

    Ok(TraceOutput {
        last_hidden_state: hidden_states,
        pooler_output,
    })
}

fn param(b: &mut GraphBuilder, param: &Param) -> Result<String> {
    let dims = param.tensor.dims().iter().map(|&d| d as i64).collect();
    let data = param.tensor.flatten_all()?.to_vec1::<f32>()?;
    b.initializer(&param.name, dims, TensorData::F32(data))
}

fn linear(b: &mut GraphBuilder, x: &str, weights: &LinearWeights) -> Result<String> {
    let weight = param(b, &weights.weight)?;
    let bias = param(b, &weights.bias)?;
    let transposed = b.transpose(&weight, &[1, 0]);
    let product = b.op("MatMul", &[x, &transposed], Vec::new());
    Ok(b.op("Add", &[&product, &bias], Vec::new()))
}

fn layer_norm(b: &mut GraphBuilder, x: &str, weights: &LayerNormWeights, eps: f64) -> Result<String> {
    let weight = param(b, &weights.weight)?;
    let bias = param(b, &weights.bias)?;
    Ok(b.layer_norm(x, &weight, &bias, eps as f32))
}

fn position_ids(b: &mut GraphBuilder, input_ids: &str, config: &EncoderConfig) -> String {
    match config.position_scheme() {
        PositionScheme::Absolute => {
            let shape = b.op("Shape", &[input_ids], Vec::new());
            let one = Initializer {
                name: "value".to_string(),
                dims: vec![1],
                data: TensorData::I64(vec![1]),
            };
            let ones = b.op(
                "ConstantOfShape",
                &[&shape],
                vec![Attribute::tensor("value", one)],
            );
            let axis = b.constant_i64_scalar(1);
            let counted = b.op("CumSum", &[&ones, &axis], Vec::new());
            let first = b.constant_i64_scalar(1);
            b.op("Sub", &[&counted, &first], Vec::new())
        }
        PositionScheme::PaddingAware => {
            let pad = b.constant_i64_scalar(i64::from(config.pad_token_id));
            let is_pad = b.op("Equal", &[input_ids, &pad], Vec::new());
            let not_pad = b.op("Not", &[&is_pad], Vec::new());
            let mask = b.cast(&not_pad, ElemType::Int64);
            let axis = b.constant_i64_scalar(1);
            let running = b.op("CumSum", &[&mask, &axis], Vec::new());
            let masked = b.op("Mul", &[&running, &mask], Vec::new());
            b.op("Add", &[&masked, &pad], Vec::new())
        }
    }
}

fn embeddings(
    b: &mut GraphBuilder,
    weights: &EncoderWeights,
    config: &EncoderConfig,
    inputs: &GraphInputs,
) -> Result<String> {
    let e = &weights.embeddings;
    let gather = |b: &mut GraphBuilder, table: &Param, ids: &str| -> Result<String> {
        let table = param(b, table)?;
        Ok(b.op("Gather", &[&table, ids], vec![Attribute::int("axis", 0)]))
    };

    let words = gather(b, &e.word, &inputs.input_ids)?;
    let positions = position_ids(b, &inputs.input_ids, config);
    let positions = gather(b, &e.position, &positions)?;
    let segments = gather(b, &e.token_type, &inputs.token_type_ids)?;

    let sum = b.op("Add", &[&words, &positions], Vec::new());
    let sum = b.op("Add", &[&sum, &segments], Vec::new());
    layer_norm(b, &sum, &e.layer_norm, config.layer_norm_eps)
}

fn extended_attention_mask(b: &mut GraphBuilder, attention_mask: &str) -> Result<String> {
    let mask = b.cast(attention_mask, ElemType::Float);
    let mask = b.unsqueeze(&mask, &[1, 2]);
    let one = b.constant_f32(1.0);
    let inverted = b.op("Sub", &[&one, &mask], Vec::new());
    let floor = b.constant_f32(MASKED_SCORE);
    Ok(b.op("Mul", &[&inverted, &floor], Vec::new()))
}

fn activate(b: &mut GraphBuilder, x: &str, activation: Activation) -> String {
    match activation {
        Activation::GeluErf => {
            let root_two = b.constant_f32(SQRT_2);
            let scaled = b.op("Div", &[x, &root_two], Vec::new());
            let erf = b.op("Erf", &[&scaled], Vec::new());
            let one = b.constant_f32(1.0);
            let shifted = b.op("Add", &[&erf, &one], Vec::new());
            let product = b.op("Mul", &[x, &shifted], Vec::new());
            let half = b.constant_f32(0.5);
            b.op("Mul", &[&product, &half], Vec::new())
        }
        Activation::GeluTanh => {
            let three = b.constant_f32(3.0);
            let cubed = b.op("Pow", &[x, &three], Vec::new());
            let coefficient = b.constant_f32(0.044_715);
            let cubed = b.op("Mul", &[&cubed, &coefficient], Vec::new());
            let inner = b.op("Add", &[x, &cubed], Vec::new());
            // sqrt(2 / pi)
            let scale = b.constant_f32(FRAC_2_SQRT_PI / SQRT_2);
            let inner = b.op("Mul", &[&inner, &scale], Vec::new());
            let tanh = b.op("Tanh", &[&inner], Vec::new());
            let one = b.constant_f32(1.0);
            let shifted = b.op("Add", &[&tanh, &one], Vec::new());
            let product = b.op("Mul", &[x, &shifted], Vec::new());
            let half = b.constant_f32(0.5);
            b.op("Mul", &[&product, &half], Vec::new())
        }
        Activation::Relu => b.op("Relu", &[x], Vec::new()),
    }
}

fn layer_trace(
    b: &mut GraphBuilder,
    hidden_states: &str,
    layer: &LayerWeights,
    mask: &str,
    config: &EncoderConfig,
    activation: Activation,
) -> Result<String> {
    let heads = config.num_attention_heads as i64;
    let head_dim = config.head_dim() as i64;
    let hidden = config.hidden_size as i64;

    let (query, key, value) = b.scoped("attention/self", |b| {
        let split_heads = |b: &mut GraphBuilder, weights: &LinearWeights, perm: &[i64]| {
            let projected = linear(b, hidden_states, weights)?;
            let split = b.reshape(&projected, &[0, 0, heads, head_dim]);
            Ok::<_, ExportError>(b.transpose(&split, perm))
        };
        let query = split_heads(b, &layer.query, &[0, 2, 1, 3])?;
        // Keys come out pre-transposed as [batch, heads, head_dim, seq].
        let key = split_heads(b, &layer.key, &[0, 2, 3, 1])?;
        let value = split_heads(b, &layer.value, &[0, 2, 1, 3])?;
        Ok((query, key, value))
    })?;

    let context = b.scoped("attention/self", |b| {
        let scores = b.op("MatMul", &[&query, &key], Vec::new());
        let width = b.constant_f32(head_dim as f32);
        let scale = b.op("Sqrt", &[&width], Vec::new());
        let scores = b.op("Div", &[&scores, &scale], Vec::new());
        let scores = b.op("Add", &[&scores, mask], Vec::new());
        let probs = b.op("Softmax", &[&scores], vec![Attribute::int("axis", -1)]);
        let context = b.op("MatMul", &[&probs, &value], Vec::new());
        let context = b.transpose(&context, &[0, 2, 1, 3]);
        Ok(b.reshape(&context, &[0, 0, hidden]))
    })?;

    let attention = b.scoped("attention/output", |b| {
        let projected = linear(b, &context, &layer.attention_output)?;
        let residual = b.op("Add", &[&projected, hidden_states], Vec::new());
        layer_norm(b, &residual, &layer.attention_norm, config.layer_norm_eps)
    })?;

    let intermediate = b.scoped("intermediate", |b| {
        let projected = linear(b, &attention, &layer.intermediate)?;
        Ok(activate(b, &projected, activation))
    })?;

    b.scoped("output", |b| {
        let projected = linear(b, &intermediate, &layer.output)?;
        let residual = b.op("Add", &[&projected, &attention], Vec::new());
        layer_norm(b, &residual, &layer.output_norm, config.layer_norm_eps)
    })
}
