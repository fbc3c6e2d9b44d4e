//! Parity check of the exported graph in ONNX Runtime.

use std::fmt;
use std::path::Path;

use candle_core::Tensor;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use tracing::info;

use crate::error::{ExportError, Result};
use crate::probe::TokenizedBatch;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyReport {
    /// Largest absolute difference over the first sequence position.
    pub max_abs_error: f32,
    pub tolerance: Option<f32>,
}

impl VerifyReport {
    /// A NaN error never passes a tolerance.
    pub fn passed(&self) -> bool {
        self.tolerance.is_none_or(|tolerance| self.max_abs_error <= tolerance)
    }

    /// Turns a failed gate into [`ExportError::ParityExceeded`].
    pub fn enforce(self) -> Result<Self> {
        match self.tolerance {
            Some(tolerance) if !self.passed() => Err(ExportError::ParityExceeded {
                max_abs_error: self.max_abs_error,
                tolerance,
            }),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[verify] max_abs_error(cls)={:.6e}", self.max_abs_error)?;
        if let Some(tolerance) = self.tolerance {
            let status = if self.passed() { "ok" } else { "FAILED" };
            write!(f, " tolerance={tolerance:.1e} {status}")?;
        }
        Ok(())
    }
}

/// Max absolute difference between two `[batch, seq, hidden]` arrays,
/// restricted to sequence position 0. Any NaN difference makes the result NaN.
pub fn first_position_max_abs_error(
    reference: &ArrayViewD<'_, f32>,
    runtime: &ArrayViewD<'_, f32>,
) -> Result<f32> {
    if reference.ndim() != 3 || reference.shape() != runtime.shape() || reference.shape()[1] == 0 {
        return Err(ExportError::ShapeMismatch {
            context: "verification outputs",
            expected: reference.shape().to_vec(),
            found: runtime.shape().to_vec(),
        });
    }
    let reference = reference.index_axis(Axis(1), 0);
    let runtime = runtime.index_axis(Axis(1), 0);
    let mut max = 0.0f32;
    Zip::from(&reference).and(&runtime).for_each(|&a, &b| {
        let diff = (a - b).abs();
        if diff.is_nan() || diff > max {
            max = diff;
        }
    });
    Ok(max)
}

pub fn tensor_to_array(tensor: &Tensor) -> Result<ArrayD<f32>> {
    let dims = tensor.dims().to_vec();
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    ArrayD::from_shape_vec(IxDyn(&dims), values).map_err(|_| ExportError::ShapeMismatch {
        context: "reference tensor",
        expected: dims.clone(),
        found: vec![tensor.elem_count()],
    })
}

/// Runs `model_path` on `batch` in ONNX Runtime and compares position 0 of
/// `last_hidden_state` against `reference`. The tolerance is only recorded;
/// callers gate with [`VerifyReport::enforce`] once the report is printed.
pub fn verify_parity(
    model_path: &Path,
    batch: &TokenizedBatch,
    reference: &Tensor,
    tolerance: Option<f32>,
) -> Result<VerifyReport> {
    let runtime = run_runtime(model_path, batch)?;
    let reference = tensor_to_array(reference)?;
    let max_abs_error = first_position_max_abs_error(&reference.view(), &runtime.view())?;
    let report = VerifyReport {
        max_abs_error,
        tolerance,
    };
    info!(max_abs_error, ?tolerance, "parity measured");
    Ok(report)
}

#[cfg(feature = "verify")]
fn run_runtime(model_path: &Path, batch: &TokenizedBatch) -> Result<ArrayD<f32>> {
    use ort::execution_providers::CPUExecutionProvider;
    use ort::session::Session;
    use ort::value::Tensor as OrtTensor;

    use crate::error::upstream;

    let mut session = Session::builder()
        .map_err(upstream("build onnxruntime session"))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .map_err(upstream("register CPU execution provider"))?
        .commit_from_file(model_path)
        .map_err(upstream("load exported model in onnxruntime"))?;

    let mut inputs = Vec::with_capacity(3);
    for (name, array) in batch.to_arrays()? {
        let tensor = OrtTensor::from_array(array).map_err(upstream("build runtime input"))?;
        inputs.push((name, tensor));
    }

    let outputs = session
        .run(inputs)
        .map_err(upstream("run onnxruntime inference"))?;
    let hidden = outputs[crate::LAST_HIDDEN_STATE]
        .try_extract_array::<f32>()
        .map_err(upstream("extract last_hidden_state"))?;
    Ok(hidden.to_owned())
}

#[cfg(not(feature = "verify"))]
fn run_runtime(_model_path: &Path, _batch: &TokenizedBatch) -> Result<ArrayD<f32>> {
    Err(ExportError::DependencyMissing {
        dependency: "onnxruntime",
        purpose: "--verify",
        hint: "Rebuild with `--features verify` to link ONNX Runtime.",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn only_first_position_is_compared() {
        let reference = Array3::<f32>::zeros((1, 3, 2)).into_dyn();
        let mut runtime = reference.clone();
        runtime[[0, 0, 1]] = 0.25;
        runtime[[0, 2, 0]] = 100.0;
        let error = first_position_max_abs_error(&reference.view(), &runtime.view()).expect("compare");
        assert_eq!(error, 0.25);
    }

    #[test]
    fn nan_output_fails_the_gate() {
        let reference = Array3::<f32>::zeros((1, 3, 2)).into_dyn();
        let mut runtime = reference.clone();
        runtime[[0, 0, 0]] = f32::NAN;
        runtime[[0, 0, 1]] = f32::NAN;
        let error = first_position_max_abs_error(&reference.view(), &runtime.view()).expect("compare");
        assert!(error.is_nan());

        let report = VerifyReport {
            max_abs_error: error,
            tolerance: Some(1e-3),
        };
        assert!(!report.passed());
        assert!(report.to_string().ends_with("FAILED"));
        assert!(matches!(
            report.enforce(),
            Err(ExportError::ParityExceeded { .. })
        ));
    }

    #[test]
    fn nan_after_a_finite_difference_still_wins() {
        let reference = Array3::<f32>::zeros((1, 2, 3)).into_dyn();
        let mut runtime = reference.clone();
        runtime[[0, 0, 0]] = 0.5;
        runtime[[0, 0, 2]] = f32::NAN;
        let error = first_position_max_abs_error(&reference.view(), &runtime.view()).expect("compare");
        assert!(error.is_nan());
    }

    #[test]
    fn passing_report_is_enforced_unchanged() {
        let report = VerifyReport {
            max_abs_error: 5e-4,
            tolerance: Some(1e-3),
        };
        assert_eq!(report.enforce().expect("within tolerance"), report);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let reference = Array3::<f32>::zeros((1, 3, 2)).into_dyn();
        let runtime = Array3::<f32>::zeros((1, 4, 2)).into_dyn();
        let err = first_position_max_abs_error(&reference.view(), &runtime.view()).expect_err("shapes differ");
        assert!(matches!(err, ExportError::ShapeMismatch { .. }));
    }

    #[test]
    fn report_line_includes_gate_status() {
        let informational = VerifyReport {
            max_abs_error: 1.5e-6,
            tolerance: None,
        };
        assert_eq!(informational.to_string(), "[verify] max_abs_error(cls)=1.500000e-6");
        assert!(informational.passed());

        let gated = VerifyReport {
            max_abs_error: 2e-3,
            tolerance: Some(1e-3),
        };
        assert!(!gated.passed());
        assert!(gated.to_string().ends_with("FAILED"));
    }

    #[cfg(not(feature = "verify"))]
    #[test]
    fn verification_requires_runtime_feature() {
        let batch = TokenizedBatch::new(vec![0], vec![1], vec![0]).expect("batch");
        let reference = Tensor::zeros((1, 1, 2), candle_core::DType::F32, &candle_core::Device::Cpu)
            .expect("tensor");
        let err = verify_parity(Path::new("missing.onnx"), &batch, &reference, None)
            .expect_err("runtime not compiled in");
        assert!(matches!(err, ExportError::DependencyMissing { .. }));
    }
}
