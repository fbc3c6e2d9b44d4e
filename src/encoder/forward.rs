//! Reference forward pass in candle.
//!
//! This is the computation the emitted graph must reproduce. Every step has a
//! counterpart in `trace.rs`; keep the two in lockstep.

use candle_core::{D, DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{Linear, Module};

use crate::error::Result;

use super::config::{Activation, EncoderConfig, PositionScheme};
use super::weights::{EncoderWeights, LayerNormWeights, LayerWeights, LinearWeights};

/// Additive bias applied to attention scores of padded keys.
pub const MASKED_SCORE: f32 = f32::MIN;

/// Position ids for one row of token ids.
pub fn position_ids(input_ids: &[u32], scheme: PositionScheme, pad_token_id: u32) -> Vec<u32> {
    match scheme {
        PositionScheme::Absolute => (0..input_ids.len() as u32).collect(),
        PositionScheme::PaddingAware => {
            let mut running = 0u32;
            input_ids
                .iter()
                .map(|&id| {
                    if id == pad_token_id {
                        pad_token_id
                    } else {
                        running += 1;
                        running + pad_token_id
                    }
                })
                .collect()
        }
    }
}

pub(super) struct ForwardOutput {
    pub last_hidden_state: Tensor,
    pub pooler_output: Option<Tensor>,
}

pub(super) fn encoder_forward(
    weights: &EncoderWeights,
    config: &EncoderConfig,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    token_type_ids: &Tensor,
) -> Result<ForwardOutput> {
    let (batch, seq_len) = input_ids.dims2()?;
    let device = input_ids.device();
    let hidden = config.hidden_size;
    let activation = config.activation()?;

    let rows = input_ids.to_vec2::<u32>()?;
    let positions: Vec<u32> = rows
        .iter()
        .flat_map(|row| position_ids(row, config.position_scheme(), config.pad_token_id))
        .collect();
    let position_ids = Tensor::from_vec(positions, (batch, seq_len), device)?;

    let lookup = |table: &Tensor, ids: &Tensor| -> Result<Tensor> {
        Ok(table
            .index_select(&ids.flatten_all()?, 0)?
            .reshape((batch, seq_len, hidden))?)
    };
    let e = &weights.embeddings;
    let embeddings = ((lookup(&e.word.tensor, input_ids)? + lookup(&e.position.tensor, &position_ids)?)?
        + lookup(&e.token_type.tensor, token_type_ids)?)?;
    let mut hidden_states = layer_norm(&embeddings, &e.layer_norm, config.layer_norm_eps)?;

    let mask = extended_attention_mask(attention_mask)?;
    for layer in &weights.layers {
        hidden_states = layer_forward(&hidden_states, layer, &mask, config, activation)?;
    }

    let pooler_output = match &weights.pooler {
        Some(pooler) => {
            let first = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
            Some(linear(&first, pooler)?.tanh()?)
        }
        None => None,
    };

    Ok(ForwardOutput {
        last_hidden_state: hidden_states,
        pooler_output,
    })
}

/// `[batch, seq]` 0/1 mask to `[batch, 1, 1, seq]` additive scores.
fn extended_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(1)?.unsqueeze(2)?;
    let inverted = mask.affine(-1.0, 1.0)?;
    Ok((inverted * f64::from(MASKED_SCORE))?)
}

fn linear(x: &Tensor, weights: &LinearWeights) -> Result<Tensor> {
    let layer = Linear::new(
        weights.weight.tensor.clone(),
        Some(weights.bias.tensor.clone()),
    );
    Ok(layer.forward(x)?)
}

fn layer_norm(x: &Tensor, weights: &LayerNormWeights, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = centered.broadcast_div(&(variance + eps)?.sqrt()?)?;
    Ok(normalized
        .broadcast_mul(&weights.weight.tensor)?
        .broadcast_add(&weights.bias.tensor)?)
}

fn activate(x: &Tensor, activation: Activation) -> Result<Tensor> {
    Ok(match activation {
        Activation::GeluErf => x.gelu_erf()?,
        Activation::GeluTanh => x.gelu()?,
        Activation::Relu => x.relu()?,
    })
}

fn layer_forward(
    hidden_states: &Tensor,
    layer: &LayerWeights,
    mask: &Tensor,
    config: &EncoderConfig,
    activation: Activation,
) -> Result<Tensor> {
    let (batch, seq_len, hidden) = hidden_states.dims3()?;
    let heads = config.num_attention_heads;
    let head_dim = config.head_dim();

    let split_heads = |x: Tensor| -> Result<Tensor> {
        Ok(x.reshape((batch, seq_len, heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    let query = split_heads(linear(hidden_states, &layer.query)?)?;
    let key = split_heads(linear(hidden_states, &layer.key)?)?;
    let value = split_heads(linear(hidden_states, &layer.value)?)?;

    let scores = query.matmul(&key.t()?.contiguous()?)?;
    let scores = (scores / (head_dim as f64).sqrt())?.broadcast_add(mask)?;
    let probs = softmax_last_dim(&scores)?;
    let context = probs
        .matmul(&value)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq_len, hidden))?;

    let attention = linear(&context, &layer.attention_output)?;
    let attention = layer_norm(
        &(attention + hidden_states)?,
        &layer.attention_norm,
        config.layer_norm_eps,
    )?;

    let intermediate = activate(&linear(&attention, &layer.intermediate)?, activation)?;
    let output = linear(&intermediate, &layer.output)?;
    layer_norm(&(output + &attention)?, &layer.output_norm, config.layer_norm_eps)
}
