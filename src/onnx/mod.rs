//! Graph export: trace an adapter, fold constants, write the model file.

pub mod fold;
pub mod graph;
pub mod proto;
pub mod writer;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::adapter::ForwardAdapter;
use crate::config::ExternalDataMode;
use crate::encoder::GraphInputs;
use crate::error::{ExportError, Result};
use crate::probe::TokenizedBatch;

use self::graph::{Dim, ElemType, GraphBuilder, ValueInfo};

pub const BATCH_AXIS: &str = "batch";
pub const SEQUENCE_AXIS: &str = "seq";

#[derive(Debug, Clone)]
pub struct GraphExportOptions {
    pub opset: i64,
    pub constant_folding: bool,
    pub external_data: ExternalDataMode,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ExportedGraph {
    pub path: PathBuf,
    pub external_data: Option<PathBuf>,
    pub opset: i64,
    pub ir_version: i64,
    pub node_count: usize,
    pub initializer_count: usize,
    pub folded_nodes: usize,
    pub hidden_size: usize,
}

fn dynamic_dims() -> Vec<Dim> {
    vec![Dim::symbolic(BATCH_AXIS), Dim::symbolic(SEQUENCE_AXIS)]
}

/// Runs the adapter once on `example` to fix the hidden width, then traces
/// it into a graph with three `int64 [batch, seq]` inputs and one output.
pub fn export_graph(
    adapter: &dyn ForwardAdapter,
    example: &TokenizedBatch,
    options: &GraphExportOptions,
    path: &Path,
) -> Result<ExportedGraph> {
    let reference = adapter.forward(example)?;
    let (_, seq_len, hidden_size) = reference.dims3()?;
    if seq_len != example.seq_len() {
        return Err(ExportError::ShapeMismatch {
            context: "example forward output",
            expected: vec![1, example.seq_len(), hidden_size],
            found: reference.dims().to_vec(),
        });
    }
    debug!(seq_len, hidden_size, "example forward pass finished");

    let mut builder = GraphBuilder::new(options.opset);
    let inputs = GraphInputs {
        input_ids: builder.input(crate::INPUT_IDS, ElemType::Int64, dynamic_dims()),
        attention_mask: builder.input(crate::ATTENTION_MASK, ElemType::Int64, dynamic_dims()),
        token_type_ids: builder.input(crate::TOKEN_TYPE_IDS, ElemType::Int64, dynamic_dims()),
    };
    let produced = adapter.trace(&mut builder, &inputs)?;

    let mut dims = dynamic_dims();
    dims.push(Dim::Fixed(hidden_size as i64));
    let output = ValueInfo {
        name: adapter.output_name().to_string(),
        elem_type: ElemType::Float,
        dims,
    };
    let mut graph = builder.finish("main_graph", vec![(produced, output)])?;

    let folded_nodes = if options.constant_folding {
        fold::fold_constants(&mut graph)?.folded_nodes
    } else {
        0
    };

    let written = writer::write_model(&graph, path, options.external_data, &options.metadata)?;
    info!(
        nodes = graph.nodes.len(),
        initializers = graph.initializers.len(),
        folded_nodes,
        "graph exported"
    );

    Ok(ExportedGraph {
        path: written.path,
        external_data: written.external_data,
        opset: graph.opset,
        ir_version: written.ir_version,
        node_count: graph.nodes.len(),
        initializer_count: graph.initializers.len(),
        folded_nodes,
        hidden_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LastHiddenState;
    use crate::encoder::fixture::tiny_model;

    fn options(opset: i64, constant_folding: bool) -> GraphExportOptions {
        GraphExportOptions {
            opset,
            constant_folding,
            external_data: ExternalDataMode::Auto,
            metadata: Vec::new(),
        }
    }

    fn example() -> TokenizedBatch {
        TokenizedBatch::new(vec![0, 5, 6, 2, 1, 1], vec![1, 1, 1, 1, 0, 0], vec![0; 6])
            .expect("batch")
    }

    #[test]
    fn exported_graph_has_one_dynamic_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.onnx");
        let model = tiny_model();
        let exported = export_graph(&LastHiddenState::new(&model), &example(), &options(17, true), &path)
            .expect("export");
        assert_eq!(exported.hidden_size, 8);

        let proto = writer::read_model(&path).expect("read");
        let graph = proto.graph.expect("graph");
        let inputs: Vec<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inputs, vec!["input_ids", "attention_mask", "token_type_ids"]);
        assert_eq!(graph.output.len(), 1);
        assert_eq!(graph.output[0].name, "last_hidden_state");
        assert_eq!(
            writer::dims_of(&graph.output[0]),
            vec![Dim::symbolic("batch"), Dim::symbolic("seq"), Dim::Fixed(8)]
        );
        // The pooler head never reaches the output, so it is pruned.
        assert!(graph.initializer.iter().all(|i| !i.name.starts_with("pooler")));
        assert!(graph.node.iter().all(|n| n.op_type != "Tanh"));
    }

    #[test]
    fn folding_removes_weight_transposes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = tiny_model();
        let adapter = LastHiddenState::new(&model);

        let unfolded = export_graph(&adapter, &example(), &options(17, false), &dir.path().join("a.onnx"))
            .expect("export");
        let folded = export_graph(&adapter, &example(), &options(17, true), &dir.path().join("b.onnx"))
            .expect("export");
        assert!(folded.folded_nodes > 0);
        assert!(folded.node_count < unfolded.node_count);

        let graph = writer::read_model(&dir.path().join("b.onnx"))
            .expect("read")
            .graph
            .expect("graph");
        assert!(graph.node.iter().all(|n| n.op_type != "Constant"));
        // Only the per-layer attention head transposes remain.
        let transposes = graph.node.iter().filter(|n| n.op_type == "Transpose").count();
        assert_eq!(transposes, 4 * model.config().num_hidden_layers);
    }

    #[test]
    fn opset_selects_layer_norm_encoding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = tiny_model();
        let adapter = LastHiddenState::new(&model);
        for (opset, fused) in [(14, false), (17, true)] {
            let path = dir.path().join(format!("opset{opset}.onnx"));
            export_graph(&adapter, &example(), &options(opset, true), &path).expect("export");
            let proto = writer::read_model(&path).expect("read");
            assert_eq!(proto.ir_version, writer::ir_version_for_opset(opset));
            let graph = proto.graph.expect("graph");
            let has_fused = graph.node.iter().any(|n| n.op_type == "LayerNormalization");
            assert_eq!(has_fused, fused, "opset {opset}");
        }
    }

    #[test]
    fn export_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = tiny_model();
        let adapter = LastHiddenState::new(&model);
        let first = dir.path().join("first.onnx");
        let second = dir.path().join("second.onnx");
        export_graph(&adapter, &example(), &options(17, true), &first).expect("export");
        export_graph(&adapter, &example(), &options(17, true), &second).expect("export");
        assert_eq!(
            std::fs::read(first).expect("first"),
            std::fs::read(second).expect("second")
        );
    }
}
