//! The fixed example input used to trace the encoder.

use candle_core::{Device, Tensor};
use ndarray::Array2;
use tokenizers::{
    PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection, TruncationParams,
    TruncationStrategy,
};

use crate::error::{ExportError, Result, upstream};

/// Sentence tokenized for the trace example.
pub const PROBE_TEXT: &str = "프리렌과 페른이 하렘에 갇히고 슈타르크가 구하러 간다";

/// Token ids, attention mask and segment ids for a batch of one.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedBatch {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
    seq_len: usize,
}

impl TokenizedBatch {
    pub fn new(input_ids: Vec<i64>, attention_mask: Vec<i64>, token_type_ids: Vec<i64>) -> Result<Self> {
        let seq_len = input_ids.len();
        if seq_len == 0 {
            return Err(ExportError::ShapeMismatch {
                context: "tokenized batch",
                expected: vec![1, 1],
                found: vec![1, 0],
            });
        }
        for (context, other) in [("attention_mask", &attention_mask), ("token_type_ids", &token_type_ids)] {
            if other.len() != seq_len {
                return Err(ExportError::ShapeMismatch {
                    context,
                    expected: vec![1, seq_len],
                    found: vec![1, other.len()],
                });
            }
        }
        for (name, values) in [
            (crate::INPUT_IDS, &input_ids),
            (crate::ATTENTION_MASK, &attention_mask),
            (crate::TOKEN_TYPE_IDS, &token_type_ids),
        ] {
            to_u32(name, values)?;
        }
        Ok(Self {
            input_ids,
            attention_mask,
            token_type_ids,
            seq_len,
        })
    }

    /// Tokenizes `text` truncated and padded to exactly `max_length` tokens.
    /// `fallback_pad_id` is used when the tokenizer does not know its pad token.
    pub fn encode(
        tokenizer: &Tokenizer,
        text: &str,
        max_length: usize,
        fallback_pad_id: u32,
    ) -> Result<Self> {
        let mut tokenizer = tokenizer.clone();

        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .unwrap_or(fallback_pad_id);
        let pad_token = tokenizer
            .id_to_token(pad_id)
            .unwrap_or_else(|| "<pad>".to_owned());

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
                direction: TruncationDirection::Right,
            }))
            .map_err(upstream("configure truncation"))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            pad_id,
            pad_token,
            ..Default::default()
        }));

        let encoding = tokenizer
            .encode(text, true)
            .map_err(upstream("tokenize example text"))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&v| i64::from(v)).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&v| i64::from(v))
            .collect();
        let token_type_ids: Vec<i64> = if encoding.get_type_ids().is_empty() {
            vec![0; input_ids.len()]
        } else {
            encoding
                .get_type_ids()
                .iter()
                .map(|&v| i64::from(v))
                .collect()
        };

        Self::new(input_ids, attention_mask, token_type_ids)
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn shape(&self) -> [usize; 2] {
        [1, self.seq_len]
    }

    /// `(input_ids, attention_mask, token_type_ids)` as candle tensors.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let shape = (1, self.seq_len);
        Ok((
            Tensor::from_vec(to_u32(crate::INPUT_IDS, &self.input_ids)?, shape, device)?,
            Tensor::from_vec(to_u32(crate::ATTENTION_MASK, &self.attention_mask)?, shape, device)?,
            Tensor::from_vec(to_u32(crate::TOKEN_TYPE_IDS, &self.token_type_ids)?, shape, device)?,
        ))
    }

    /// Named `i64` arrays in graph input order.
    pub fn to_arrays(&self) -> Result<[(&'static str, Array2<i64>); 3]> {
        let build = |name: &'static str, values: &[i64]| -> Result<(&'static str, Array2<i64>)> {
            let array = Array2::from_shape_vec((1, self.seq_len), values.to_vec()).map_err(
                |_| ExportError::ShapeMismatch {
                    context: "graph input array",
                    expected: vec![1, self.seq_len],
                    found: vec![values.len()],
                },
            )?;
            Ok((name, array))
        };
        Ok([
            build(crate::INPUT_IDS, &self.input_ids)?,
            build(crate::ATTENTION_MASK, &self.attention_mask)?,
            build(crate::TOKEN_TYPE_IDS, &self.token_type_ids)?,
        ])
    }
}

/// Ids index embedding tables, so they must fit `u32`.
fn to_u32(name: &str, values: &[i64]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .map_err(|_| ExportError::InvalidConfig(format!("{name} value {v} is outside 0..=u32::MAX")))
        })
        .collect()
}
