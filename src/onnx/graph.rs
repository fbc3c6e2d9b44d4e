//! In-memory graph under construction, before it becomes protobuf.

use std::collections::{HashMap, HashSet};

use crate::error::{ExportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ElemType {
    Float = 1,
    Int64 = 7,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

impl Dim {
    pub fn symbolic(name: &str) -> Self {
        Self::Symbolic(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub elem_type: ElemType,
    pub dims: Vec<Dim>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Self::F32(v) => v.len() * std::mem::size_of::<f32>(),
            Self::I64(v) => v.len() * std::mem::size_of::<i64>(),
        }
    }

    pub fn elem_type(&self) -> ElemType {
        match self {
            Self::F32(_) => ElemType::Float,
            Self::I64(_) => ElemType::Int64,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

/// A named constant tensor. Scalars have empty `dims`.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<i64>,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Tensor(Initializer),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Int(value),
        }
    }

    pub fn float(name: &str, value: f32) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Float(value),
        }
    }

    pub fn ints(name: &str, values: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Ints(values.to_vec()),
        }
    }

    pub fn tensor(name: &str, value: Initializer) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Tensor(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<Attribute>,
}

impl Node {
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }
}

/// A finished graph: nodes are in topological order and every node output
/// feeds a declared output.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub opset: i64,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl Graph {
    pub fn initializer_bytes(&self) -> usize {
        self.initializers.iter().map(|i| i.data.byte_len()).sum()
    }

    pub fn count_op(&self, op_type: &str) -> usize {
        self.nodes.iter().filter(|n| n.op_type == op_type).count()
    }
}

pub struct GraphBuilder {
    opset: i64,
    nodes: Vec<Node>,
    initializers: Vec<Initializer>,
    initializer_names: HashSet<String>,
    inputs: Vec<ValueInfo>,
    scope: Vec<String>,
    op_counters: HashMap<String, usize>,
    const_counter: usize,
}

impl GraphBuilder {
    pub fn new(opset: i64) -> Self {
        Self {
            opset,
            nodes: Vec::new(),
            initializers: Vec::new(),
            initializer_names: HashSet::new(),
            inputs: Vec::new(),
            scope: Vec::new(),
            op_counters: HashMap::new(),
            const_counter: 0,
        }
    }

    pub fn input(&mut self, name: &str, elem_type: ElemType, dims: Vec<Dim>) -> String {
        self.inputs.push(ValueInfo {
            name: name.to_string(),
            elem_type,
            dims,
        });
        name.to_string()
    }

    /// Registers a named weight. Re-registering a name returns the existing one.
    pub fn initializer(&mut self, name: &str, dims: Vec<i64>, data: TensorData) -> Result<String> {
        let expected: i64 = dims.iter().product();
        if expected as usize != data.len() {
            return Err(ExportError::ShapeMismatch {
                context: "initializer",
                expected: dims.iter().map(|&d| d as usize).collect(),
                found: vec![data.len()],
            });
        }
        if self.initializer_names.insert(name.to_string()) {
            self.initializers.push(Initializer {
                name: name.to_string(),
                dims,
                data,
            });
        }
        Ok(name.to_string())
    }

    /// An anonymous `i64` initializer, used for shapes and axes.
    pub fn const_i64(&mut self, values: &[i64]) -> String {
        self.const_counter += 1;
        let name = format!("onnx::Const_{}", self.const_counter);
        self.initializer_names.insert(name.clone());
        self.initializers.push(Initializer {
            name: name.clone(),
            dims: vec![values.len() as i64],
            data: TensorData::I64(values.to_vec()),
        });
        name
    }

    /// A scalar `Constant` node; folded into an initializer when folding runs.
    pub fn constant_f32(&mut self, value: f32) -> String {
        let tensor = Initializer {
            name: "value".to_string(),
            dims: Vec::new(),
            data: TensorData::F32(vec![value]),
        };
        self.op("Constant", &[], vec![Attribute::tensor("value", tensor)])
    }

    pub fn constant_i64_scalar(&mut self, value: i64) -> String {
        let tensor = Initializer {
            name: "value".to_string(),
            dims: Vec::new(),
            data: TensorData::I64(vec![value]),
        };
        self.op("Constant", &[], vec![Attribute::tensor("value", tensor)])
    }

    /// Runs `f` with `name` pushed onto the node-name scope.
    pub fn scoped<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.scope.push(name.to_string());
        let result = f(self);
        self.scope.pop();
        result
    }

    /// Appends a single-output node and returns its output name.
    pub fn op(&mut self, op_type: &str, inputs: &[&str], attributes: Vec<Attribute>) -> String {
        let mut base = String::new();
        for part in &self.scope {
            base.push('/');
            base.push_str(part);
        }
        base.push('/');
        base.push_str(op_type);
        let counter = self.op_counters.entry(base.clone()).or_insert(0);
        let name = if *counter == 0 {
            base
        } else {
            format!("{base}_{counter}")
        };
        *counter += 1;
        let output = format!("{name}_output_0");
        self.nodes.push(Node {
            name,
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![output.clone()],
            attributes,
        });
        output
    }

    /// Declares `outputs` (renaming the producing values) and drops everything
    /// that does not contribute to them.
    pub fn finish(mut self, name: &str, outputs: Vec<(String, ValueInfo)>) -> Result<Graph> {
        let renames: HashMap<String, String> = outputs
            .iter()
            .map(|(produced, info)| (produced.clone(), info.name.clone()))
            .collect();
        for node in &mut self.nodes {
            for value in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if let Some(renamed) = renames.get(value) {
                    *value = renamed.clone();
                }
            }
        }

        let mut needed: HashSet<String> = outputs.iter().map(|(_, info)| info.name.clone()).collect();
        let mut keep = vec![false; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate().rev() {
            if node.outputs.iter().any(|o| needed.contains(o)) {
                keep[index] = true;
                needed.extend(node.inputs.iter().filter(|i| !i.is_empty()).cloned());
            }
        }

        let produced: HashSet<&String> = self
            .nodes
            .iter()
            .zip(&keep)
            .filter(|(_, kept)| **kept)
            .flat_map(|(node, _)| node.outputs.iter())
            .collect();
        for (_, info) in &outputs {
            let is_input = self.inputs.iter().any(|i| i.name == info.name);
            if !produced.contains(&info.name) && !is_input {
                return Err(ExportError::Unsupported(format!(
                    "graph output '{}' is not produced by any node",
                    info.name
                )));
            }
        }

        let nodes = self
            .nodes
            .into_iter()
            .zip(keep)
            .filter_map(|(node, kept)| kept.then_some(node))
            .collect();
        let initializers = self
            .initializers
            .into_iter()
            .filter(|init| needed.contains(&init.name))
            .collect();

        Ok(Graph {
            name: name.to_string(),
            opset: self.opset,
            nodes,
            initializers,
            inputs: self.inputs,
            outputs: outputs.into_iter().map(|(_, info)| info).collect(),
        })
    }
}

/// Operator helpers whose encoding depends on the target opset.
impl GraphBuilder {
    pub fn transpose(&mut self, x: &str, perm: &[i64]) -> String {
        self.op("Transpose", &[x], vec![Attribute::ints("perm", perm)])
    }

    pub fn cast(&mut self, x: &str, to: ElemType) -> String {
        self.op("Cast", &[x], vec![Attribute::int("to", to as i64)])
    }

    pub fn reshape(&mut self, x: &str, shape: &[i64]) -> String {
        let shape = self.const_i64(shape);
        self.op("Reshape", &[x, &shape], Vec::new())
    }

    /// Axes travel as an input; every supported opset is at least 13.
    pub fn unsqueeze(&mut self, x: &str, axes: &[i64]) -> String {
        let axes = self.const_i64(axes);
        self.op("Unsqueeze", &[x, &axes], Vec::new())
    }

    pub fn reduce_mean(&mut self, x: &str, axes: &[i64]) -> String {
        let keepdims = Attribute::int("keepdims", 1);
        if self.opset >= 18 {
            let axes = self.const_i64(axes);
            self.op("ReduceMean", &[x, &axes], vec![keepdims])
        } else {
            self.op(
                "ReduceMean",
                &[x],
                vec![Attribute::ints("axes", axes), keepdims],
            )
        }
    }

    /// Layer normalization over the last axis.
    pub fn layer_norm(&mut self, x: &str, weight: &str, bias: &str, epsilon: f32) -> String {
        if self.opset >= 17 {
            return self.op(
                "LayerNormalization",
                &[x, weight, bias],
                vec![Attribute::int("axis", -1), Attribute::float("epsilon", epsilon)],
            );
        }
        let mean = self.reduce_mean(x, &[-1]);
        let centered = self.op("Sub", &[x, &mean], Vec::new());
        let two = self.constant_f32(2.0);
        let squared = self.op("Pow", &[&centered, &two], Vec::new());
        let variance = self.reduce_mean(&squared, &[-1]);
        let eps = self.constant_f32(epsilon);
        let shifted = self.op("Add", &[&variance, &eps], Vec::new());
        let std = self.op("Sqrt", &[&shifted], Vec::new());
        let normalized = self.op("Div", &[&centered, &std], Vec::new());
        let scaled = self.op("Mul", &[&normalized, weight], Vec::new());
        self.op("Add", &[&scaled, bias], Vec::new())
    }
}
