//! Serializing a finished graph to `.onnx`, with an optional weight sidecar.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::{debug, info};

use crate::config::ExternalDataMode;
use crate::error::{ExportError, Result};

use super::graph::{AttrValue, Attribute, Dim, Graph, Initializer, Node, ValueInfo};
use super::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, attribute_proto::AttributeType,
    tensor_proto::DataLocation, tensor_shape_proto, type_proto,
};

/// Protobuf messages cannot exceed 2 GiB; leave headroom for the graph itself.
pub const INLINE_LIMIT_BYTES: usize = 1_800 * 1024 * 1024;
/// Initializers smaller than this stay inline even when a sidecar is written.
pub const EXTERNAL_MIN_BYTES: usize = 1024;

pub const PRODUCER_NAME: &str = env!("CARGO_PKG_NAME");

/// IR version matching the opset, so older runtimes accept the file.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

#[derive(Debug, Clone)]
pub struct WrittenModel {
    pub path: PathBuf,
    pub external_data: Option<PathBuf>,
    pub ir_version: i64,
}

/// Path of the sidecar written next to `model_path`.
pub fn external_data_path(model_path: &Path) -> PathBuf {
    let mut name = model_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".data");
    model_path.with_file_name(name)
}

fn use_external_data(graph: &Graph, mode: ExternalDataMode) -> Result<bool> {
    let total = graph.initializer_bytes();
    match mode {
        ExternalDataMode::Always => Ok(true),
        ExternalDataMode::Auto => Ok(total > INLINE_LIMIT_BYTES),
        ExternalDataMode::Never if total > INLINE_LIMIT_BYTES => Err(ExportError::Unsupported(
            format!(
                "initializers total {total} bytes, above the protobuf limit; use external data"
            ),
        )),
        ExternalDataMode::Never => Ok(false),
    }
}

pub fn write_model(
    graph: &Graph,
    path: &Path,
    mode: ExternalDataMode,
    metadata: &[(String, String)],
) -> Result<WrittenModel> {
    let external = use_external_data(graph, mode)?;
    let data_path = external_data_path(path);

    let initializers = if external {
        write_external(&graph.initializers, &data_path)?
    } else {
        if data_path.exists() {
            // A stale sidecar from an earlier external export would be misleading.
            fs::remove_file(&data_path).map_err(ExportError::io(&data_path))?;
        }
        graph.initializers.iter().map(inline_tensor).collect()
    };

    let ir_version = ir_version_for_opset(graph.opset);
    let model = ModelProto {
        ir_version,
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        domain: String::new(),
        model_version: 1,
        doc_string: String::new(),
        graph: Some(GraphProto {
            node: graph.nodes.iter().map(node_proto).collect(),
            name: graph.name.clone(),
            initializer: initializers,
            doc_string: String::new(),
            input: graph.inputs.iter().map(value_info_proto).collect(),
            output: graph.outputs.iter().map(value_info_proto).collect(),
            value_info: Vec::new(),
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: graph.opset,
        }],
        metadata_props: metadata
            .iter()
            .map(|(key, value)| StringStringEntryProto {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    };

    let bytes = model.encode_to_vec();
    fs::write(path, &bytes).map_err(ExportError::io(path))?;
    info!(
        path = %path.display(),
        bytes = bytes.len(),
        ir_version,
        external,
        "onnx model written"
    );

    Ok(WrittenModel {
        path: path.to_path_buf(),
        external_data: external.then_some(data_path),
        ir_version,
    })
}

pub fn read_model(path: &Path) -> Result<ModelProto> {
    let bytes = fs::read(path).map_err(ExportError::io(path))?;
    ModelProto::decode(bytes.as_slice()).map_err(|err| ExportError::Upstream {
        stage: "decode onnx model",
        message: err.to_string(),
    })
}

fn write_external(initializers: &[Initializer], data_path: &Path) -> Result<Vec<TensorProto>> {
    let file = File::create(data_path).map_err(ExportError::io(data_path))?;
    let mut writer = BufWriter::new(file);
    let location = data_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut offset = 0usize;
    let mut tensors = Vec::with_capacity(initializers.len());
    for init in initializers {
        let length = init.data.byte_len();
        if length < EXTERNAL_MIN_BYTES {
            tensors.push(inline_tensor(init));
            continue;
        }
        writer
            .write_all(&init.data.to_le_bytes())
            .map_err(ExportError::io(data_path))?;
        let entry = |key: &str, value: String| StringStringEntryProto {
            key: key.to_string(),
            value,
        };
        tensors.push(TensorProto {
            dims: init.dims.clone(),
            data_type: init.data.elem_type() as i32,
            name: init.name.clone(),
            external_data: vec![
                entry("location", location.clone()),
                entry("offset", offset.to_string()),
                entry("length", length.to_string()),
            ],
            data_location: DataLocation::External as i32,
            ..Default::default()
        });
        offset += length;
    }
    writer.flush().map_err(ExportError::io(data_path))?;
    debug!(path = %data_path.display(), bytes = offset, "external data written");
    Ok(tensors)
}

fn inline_tensor(init: &Initializer) -> TensorProto {
    TensorProto {
        dims: init.dims.clone(),
        data_type: init.data.elem_type() as i32,
        name: init.name.clone(),
        raw_data: init.data.to_le_bytes(),
        ..Default::default()
    }
}

fn attribute_proto(attribute: &Attribute) -> AttributeProto {
    let mut proto = AttributeProto {
        name: attribute.name.clone(),
        ..Default::default()
    };
    match &attribute.value {
        AttrValue::Int(value) => {
            proto.i = *value;
            proto.r#type = AttributeType::Int as i32;
        }
        AttrValue::Float(value) => {
            proto.f = *value;
            proto.r#type = AttributeType::Float as i32;
        }
        AttrValue::Ints(values) => {
            proto.ints = values.clone();
            proto.r#type = AttributeType::Ints as i32;
        }
        AttrValue::Tensor(tensor) => {
            proto.t = Some(inline_tensor(tensor));
            proto.r#type = AttributeType::Tensor as i32;
        }
    }
    proto
}

fn node_proto(node: &Node) -> NodeProto {
    NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        attribute: node.attributes.iter().map(attribute_proto).collect(),
        ..Default::default()
    }
}

fn value_info_proto(info: &ValueInfo) -> ValueInfoProto {
    let dim = info
        .dims
        .iter()
        .map(|dim| tensor_shape_proto::Dimension {
            value: Some(match dim {
                Dim::Fixed(value) => tensor_shape_proto::dimension::Value::DimValue(*value),
                Dim::Symbolic(name) => tensor_shape_proto::dimension::Value::DimParam(name.clone()),
            }),
        })
        .collect();
    ValueInfoProto {
        name: info.name.clone(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: info.elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
    }
}

/// Elem type of a decoded value info, if it is a tensor.
pub fn elem_type_of(info: &ValueInfoProto) -> Option<i32> {
    match info.r#type.as_ref()?.value.as_ref()? {
        type_proto::Value::TensorType(tensor) => Some(tensor.elem_type),
    }
}

/// Dims of a decoded value info, symbolic ones by name.
pub fn dims_of(info: &ValueInfoProto) -> Vec<Dim> {
    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
    }) = info.r#type.as_ref()
    else {
        return Vec::new();
    };
    tensor
        .shape
        .iter()
        .flat_map(|shape| shape.dim.iter())
        .filter_map(|dim| match dim.value.as_ref()? {
            tensor_shape_proto::dimension::Value::DimValue(v) => Some(Dim::Fixed(*v)),
            tensor_shape_proto::dimension::Value::DimParam(p) => Some(Dim::Symbolic(p.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::graph::{ElemType, GraphBuilder, TensorData};

    fn small_graph(weight_len: usize) -> Graph {
        let mut b = GraphBuilder::new(17);
        let x = b.input(
            "input_ids",
            ElemType::Float,
            vec![Dim::symbolic("batch"), Dim::Fixed(weight_len as i64)],
        );
        let w = b
            .initializer("w", vec![weight_len as i64], TensorData::F32(vec![0.5; weight_len]))
            .expect("w");
        let y = b.op("Mul", &[&x, &w], Vec::new());
        b.finish(
            "g",
            vec![(
                y,
                ValueInfo {
                    name: "y".to_string(),
                    elem_type: ElemType::Float,
                    dims: vec![Dim::symbolic("batch"), Dim::Fixed(weight_len as i64)],
                },
            )],
        )
        .expect("finish")
    }

    #[test]
    fn ir_version_tracks_opset() {
        assert_eq!(ir_version_for_opset(13), 7);
        assert_eq!(ir_version_for_opset(17), 8);
        assert_eq!(ir_version_for_opset(19), 9);
        assert_eq!(ir_version_for_opset(21), 10);
    }

    #[test]
    fn inline_model_round_trips_through_prost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.onnx");
        let metadata = vec![("source_model".to_string(), "tiny".to_string())];
        let written = write_model(&small_graph(4), &path, ExternalDataMode::Auto, &metadata)
            .expect("write");
        assert!(written.external_data.is_none());

        let model = read_model(&path).expect("read");
        assert_eq!(model.ir_version, 8);
        assert_eq!(model.opset_import[0].version, 17);
        assert_eq!(model.metadata_props[0].value, "tiny");
        let graph = model.graph.expect("graph");
        assert_eq!(graph.output.len(), 1);
        assert_eq!(dims_of(&graph.input[0])[0], Dim::symbolic("batch"));
        assert_eq!(elem_type_of(&graph.output[0]), Some(ElemType::Float as i32));
        assert_eq!(graph.initializer[0].raw_data.len(), 16);
    }

    #[test]
    fn always_mode_moves_large_weights_to_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.onnx");
        let written = write_model(&small_graph(512), &path, ExternalDataMode::Always, &[])
            .expect("write");
        let data_path = written.external_data.expect("sidecar");
        assert_eq!(data_path, dir.path().join("m.onnx.data"));
        assert_eq!(fs::metadata(&data_path).expect("sidecar exists").len(), 2048);

        let model = read_model(&path).expect("read");
        let tensor = &model.graph.expect("graph").initializer[0];
        assert!(tensor.raw_data.is_empty());
        assert_eq!(tensor.data_location, DataLocation::External as i32);
        assert_eq!(tensor.external_data[0].value, "m.onnx.data");
    }

    #[test]
    fn inline_export_removes_stale_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.onnx");
        fs::write(external_data_path(&path), b"stale").expect("seed sidecar");
        write_model(&small_graph(4), &path, ExternalDataMode::Never, &[]).expect("write");
        assert!(!external_data_path(&path).exists());
    }
}
