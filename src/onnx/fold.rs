//! Constant folding: evaluate nodes whose inputs are all known at export time.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, IxDyn};
use tracing::debug;

use crate::error::{ExportError, Result};

use super::graph::{AttrValue, ElemType, Graph, Initializer, Node, TensorData};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded_nodes: usize,
    pub removed_initializers: usize,
}

#[derive(Debug, Clone)]
enum Value {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl Value {
    fn from_initializer(init: &Initializer) -> Result<Self> {
        let shape = IxDyn(&init.dims.iter().map(|&d| d as usize).collect::<Vec<_>>());
        let mismatch = |found: usize| ExportError::ShapeMismatch {
            context: "folded constant",
            expected: init.dims.iter().map(|&d| d as usize).collect(),
            found: vec![found],
        };
        Ok(match &init.data {
            TensorData::F32(values) => Self::F32(
                ArrayD::from_shape_vec(shape, values.clone()).map_err(|_| mismatch(values.len()))?,
            ),
            TensorData::I64(values) => Self::I64(
                ArrayD::from_shape_vec(shape, values.clone()).map_err(|_| mismatch(values.len()))?,
            ),
        })
    }

    fn into_initializer(self, name: &str) -> Initializer {
        let (dims, data) = match self {
            Self::F32(array) => (array.shape().to_vec(), TensorData::F32(array.iter().copied().collect())),
            Self::I64(array) => (array.shape().to_vec(), TensorData::I64(array.iter().copied().collect())),
        };
        Initializer {
            name: name.to_string(),
            dims: dims.into_iter().map(|d| d as i64).collect(),
            data,
        }
    }
}

/// Replaces foldable nodes by initializers, then drops initializers no node
/// reads any more.
pub fn fold_constants(graph: &mut Graph) -> Result<FoldStats> {
    let mut stats = FoldStats::default();
    let mut known: HashMap<String, usize> = graph
        .initializers
        .iter()
        .enumerate()
        .map(|(index, init)| (init.name.clone(), index))
        .collect();

    let mut kept = Vec::with_capacity(graph.nodes.len());
    for node in std::mem::take(&mut graph.nodes) {
        let inputs: Option<Vec<&Initializer>> = node
            .inputs
            .iter()
            .map(|name| known.get(name).map(|&index| &graph.initializers[index]))
            .collect();
        let folded = match inputs {
            Some(inputs) => evaluate(&node, &inputs)?,
            None => None,
        };
        match folded {
            Some(value) => {
                let output = &node.outputs[0];
                known.insert(output.clone(), graph.initializers.len());
                graph.initializers.push(value.into_initializer(output));
                stats.folded_nodes += 1;
            }
            None => kept.push(node),
        }
    }
    graph.nodes = kept;

    let referenced: HashSet<&str> = graph
        .nodes
        .iter()
        .flat_map(|node| node.inputs.iter().map(String::as_str))
        .chain(graph.outputs.iter().map(|o| o.name.as_str()))
        .collect();
    let before = graph.initializers.len();
    let retained: Vec<Initializer> = std::mem::take(&mut graph.initializers)
        .into_iter()
        .filter(|init| referenced.contains(init.name.as_str()))
        .collect();
    graph.initializers = retained;
    stats.removed_initializers = before - graph.initializers.len();

    debug!(
        folded = stats.folded_nodes,
        removed = stats.removed_initializers,
        "constant folding finished"
    );
    Ok(stats)
}

/// `Ok(None)` means the node is left for the runtime.
fn evaluate(node: &Node, inputs: &[&Initializer]) -> Result<Option<Value>> {
    if node.outputs.len() != 1 {
        return Ok(None);
    }
    let values = inputs
        .iter()
        .map(|init| Value::from_initializer(init))
        .collect::<Result<Vec<_>>>()?;

    let value = match (node.op_type.as_str(), values.as_slice()) {
        ("Constant", []) => match node.attribute("value") {
            Some(AttrValue::Tensor(tensor)) => Value::from_initializer(tensor)?,
            _ => return Ok(None),
        },
        ("Transpose", [value]) => {
            let perm = match node.attribute("perm") {
                Some(AttrValue::Ints(perm)) => perm.iter().map(|&p| p as usize).collect(),
                _ => (0..rank(value)).rev().collect::<Vec<_>>(),
            };
            match value {
                Value::F32(a) => Value::F32(a.clone().permuted_axes(IxDyn(&perm)).as_standard_layout().into_owned()),
                Value::I64(a) => Value::I64(a.clone().permuted_axes(IxDyn(&perm)).as_standard_layout().into_owned()),
            }
        }
        ("Sqrt", [Value::F32(a)]) => Value::F32(a.mapv(f32::sqrt)),
        ("Cast", [value]) => {
            let to = match node.attribute("to") {
                Some(AttrValue::Int(to)) => *to,
                _ => return Ok(None),
            };
            match (value, to) {
                (Value::F32(a), t) if t == ElemType::Float as i64 => Value::F32(a.clone()),
                (Value::I64(a), t) if t == ElemType::Float as i64 => Value::F32(a.mapv(|x| x as f32)),
                (Value::I64(a), t) if t == ElemType::Int64 as i64 => Value::I64(a.clone()),
                (Value::F32(a), t) if t == ElemType::Int64 as i64 => Value::I64(a.mapv(|x| x as i64)),
                _ => return Ok(None),
            }
        }
        (op @ ("Add" | "Sub" | "Mul" | "Div"), [Value::F32(a), Value::F32(b)]) => {
            if broadcast_shape(a.shape(), b.shape()).is_none() {
                return Err(ExportError::ShapeMismatch {
                    context: "folded binary operands",
                    expected: a.shape().to_vec(),
                    found: b.shape().to_vec(),
                });
            }
            Value::F32(match op {
                "Add" => a + b,
                "Sub" => a - b,
                "Mul" => a * b,
                _ => a / b,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn rank(value: &Value) -> usize {
    match value {
        Value::F32(a) => a.ndim(),
        Value::I64(a) => a.ndim(),
    }
}

/// Numpy-style broadcast of two shapes.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let offset = rank - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::graph::{Attribute, Dim, GraphBuilder, ValueInfo};

    fn output(name: &str) -> ValueInfo {
        ValueInfo {
            name: name.to_string(),
            elem_type: ElemType::Float,
            dims: vec![Dim::symbolic("batch"), Dim::Fixed(2)],
        }
    }

    #[test]
    fn transposed_weights_become_initializers() {
        let mut b = GraphBuilder::new(17);
        let x = b.input("x", ElemType::Float, vec![Dim::symbolic("batch"), Dim::Fixed(3)]);
        let w = b
            .initializer("w", vec![2, 3], TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
            .expect("w");
        let wt = b.transpose(&w, &[1, 0]);
        let y = b.op("MatMul", &[&x, &wt], Vec::new());
        let mut graph = b.finish("g", vec![(y, output("y"))]).expect("finish");

        let stats = fold_constants(&mut graph).expect("fold");
        assert_eq!(stats.folded_nodes, 1);
        assert_eq!(stats.removed_initializers, 1);
        assert_eq!(graph.count_op("Transpose"), 0);
        let folded = &graph.initializers[0];
        assert_eq!(folded.dims, vec![3, 2]);
        assert_eq!(folded.data, TensorData::F32(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
    }

    #[test]
    fn constant_chains_fold_to_a_single_value() {
        let mut b = GraphBuilder::new(17);
        let x = b.input("x", ElemType::Float, vec![Dim::symbolic("batch"), Dim::Fixed(2)]);
        let width = b.constant_f32(16.0);
        let scale = b.op("Sqrt", &[&width], Vec::new());
        let y = b.op("Div", &[&x, &scale], Vec::new());
        let mut graph = b.finish("g", vec![(y, output("y"))]).expect("finish");

        let stats = fold_constants(&mut graph).expect("fold");
        assert_eq!(stats.folded_nodes, 2);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.count_op("Constant"), 0);
        assert_eq!(graph.initializers.len(), 1);
        assert_eq!(graph.initializers[0].data, TensorData::F32(vec![4.0]));
    }

    #[test]
    fn runtime_dependent_nodes_are_kept() {
        let mut b = GraphBuilder::new(17);
        let x = b.input("x", ElemType::Int64, vec![Dim::symbolic("batch"), Dim::Fixed(2)]);
        let y = b.op("Cast", &[&x], vec![Attribute::int("to", ElemType::Float as i64)]);
        let mut graph = b.finish("g", vec![(y, output("y"))]).expect("finish");
        let stats = fold_constants(&mut graph).expect("fold");
        assert_eq!(stats, FoldStats::default());
        assert_eq!(graph.nodes.len(), 1);
    }

    #[test]
    fn broadcasting_follows_numpy_rules() {
        assert_eq!(broadcast_shape(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[1, 4], &[3, 1]), Some(vec![3, 4]));
        assert_eq!(broadcast_shape(&[2], &[3]), None);
    }
}
