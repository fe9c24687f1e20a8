//! Predictor backends
//!
//! The segmentation network is opaque to the engine: anything that maps
//! a `(C, X, Y, Z)` tensor to class logits can sit behind
//! [`Predictor`]. The default backend loads an ONNX graph through
//! `ort`, preferring the CUDA execution provider when it is available.

use ndarray::Array4;
use serde::Serialize;

use super::Result;
#[cfg(feature = "onnx")]
use super::ModelError;

// ============================================================================
// DEVICE
// ============================================================================

/// Compute device the predictor runs on. Selected once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Requested device from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use the accelerator when present
    #[default]
    Auto,
    /// Require the accelerator, falling back to CPU with a warning
    Cuda,
    /// Host compute only
    Cpu,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "cpu" => Ok(DevicePreference::Cpu),
            _ => Err(format!("Unknown device: {}", s)),
        }
    }
}

/// Accelerator memory snapshot, when the backend can report one.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorMemory {
    pub allocated_mb: f64,
    pub reserved_mb: f64,
    pub total_mb: f64,
    pub free_mb: f64,
}

// ============================================================================
// TRAITS
// ============================================================================

/// A loaded segmentation network.
///
/// Implementations are not expected to be thread-safe; the model
/// manager serializes every call.
pub trait Predictor: Send {
    /// Expected input channel count.
    fn input_channels(&self) -> usize;

    /// Output class count (background included).
    fn num_classes(&self) -> usize;

    /// Total parameter count, when the backend knows it.
    fn parameter_count(&self) -> Option<u64> {
        None
    }

    /// Accelerator memory snapshot, when the backend can report one.
    fn memory_usage(&self) -> Option<AcceleratorMemory> {
        None
    }

    /// Run a forward pass: `(C, X, Y, Z)` in, `(classes, X, Y, Z)` out.
    fn predict(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;
}

/// Builds predictors. The factory outlives individual predictor
/// instances so the manager can tear the network down and reload it.
pub trait PredictorFactory: Send + Sync {
    fn load(&self, device: Device) -> Result<Box<dyn Predictor>>;
}

// ============================================================================
// ONNX BACKEND
// ============================================================================

#[cfg(feature = "onnx")]
pub use onnx::{OnnxPredictorFactory, accelerator_available};

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::{Path, PathBuf};

    use ndarray::{Array4, Axis, IxDyn};
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    use ort::session::{Session, builder::GraphOptimizationLevel};
    use ort::value::Value;

    use super::{Device, ModelError, Predictor, PredictorFactory, Result};

    /// Whether the CUDA execution provider can be used in this process.
    pub fn accelerator_available() -> bool {
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }

    /// Loads ONNX segmentation models from a file path.
    pub struct OnnxPredictorFactory {
        model_path: PathBuf,
        input_name: String,
        input_channels: usize,
        num_classes: usize,
    }

    impl OnnxPredictorFactory {
        pub fn new(
            model_path: impl Into<PathBuf>,
            input_name: impl Into<String>,
            input_channels: usize,
            num_classes: usize,
        ) -> Self {
            Self {
                model_path: model_path.into(),
                input_name: input_name.into(),
                input_channels,
                num_classes,
            }
        }

        pub fn model_path(&self) -> &Path {
            &self.model_path
        }
    }

    impl PredictorFactory for OnnxPredictorFactory {
        fn load(&self, device: Device) -> Result<Box<dyn Predictor>> {
            if !self.model_path.exists() {
                return Err(ModelError::NotFound(
                    self.model_path.display().to_string(),
                ));
            }

            let mut builder = Session::builder()
                .map_err(|e| ModelError::LoadFailed(format!("session builder: {}", e)))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| ModelError::LoadFailed(format!("optimization config: {}", e)))?
                .with_intra_threads(4)
                .map_err(|e| ModelError::LoadFailed(format!("thread config: {}", e)))?;

            if device == Device::Cuda {
                let cuda = CUDAExecutionProvider::default()
                    .with_device_id(0)
                    .build();
                builder = builder
                    .with_execution_providers([cuda])
                    .map_err(|e| ModelError::LoadFailed(format!("CUDA config: {}", e)))?;
            }

            let session = builder
                .commit_from_file(&self.model_path)
                .map_err(|e| {
                    ModelError::LoadFailed(format!(
                        "{}: {}",
                        self.model_path.display(),
                        e
                    ))
                })?;

            tracing::info!(
                model = %self.model_path.display(),
                %device,
                "ONNX session created"
            );

            Ok(Box::new(OnnxPredictor {
                session,
                input_name: self.input_name.clone(),
                input_channels: self.input_channels,
                num_classes: self.num_classes,
            }))
        }
    }

    struct OnnxPredictor {
        session: Session,
        input_name: String,
        input_channels: usize,
        num_classes: usize,
    }

    impl Predictor for OnnxPredictor {
        fn input_channels(&self) -> usize {
            self.input_channels
        }

        fn num_classes(&self) -> usize {
            self.num_classes
        }

        fn predict(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
            let (_, nx, ny, nz) = input.dim();

            // the graph expects a leading batch axis
            let batched = input.clone().insert_axis(Axis(0)).into_dyn();
            let value = Value::from_array(batched)
                .map_err(|e| ModelError::InferenceFailed(format!("input tensor: {}", e)))?;

            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => value])
                .map_err(|e| ModelError::InferenceFailed(e.to_string()))?;

            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("output tensor: {}", e)))?;

            let expected_len = self.num_classes * nx * ny * nz;
            if data.len() != expected_len {
                return Err(ModelError::InferenceFailed(format!(
                    "output holds {} values, expected {}",
                    data.len(),
                    expected_len
                )));
            }

            ndarray::Array::from_shape_vec(
                IxDyn(&[self.num_classes, nx, ny, nz]),
                data.to_vec(),
            )
            .map_err(|e| ModelError::InferenceFailed(e.to_string()))?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| ModelError::InferenceFailed(e.to_string()))
        }
    }
}

/// Whether the CUDA execution provider can be used in this process.
/// Without the ONNX backend there is no accelerator path at all.
#[cfg(not(feature = "onnx"))]
pub fn accelerator_available() -> bool {
    false
}

/// Resolve the effective device from the configured preference.
/// A forced accelerator that is absent degrades to CPU with a warning
/// instead of failing startup.
pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Auto => {
            if accelerator_available() {
                Device::Cuda
            } else {
                Device::Cpu
            }
        }
        DevicePreference::Cuda => {
            if accelerator_available() {
                Device::Cuda
            } else {
                tracing::warn!("CUDA requested but unavailable, using CPU");
                Device::Cpu
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_preference_parses() {
        assert_eq!("auto".parse::<DevicePreference>(), Ok(DevicePreference::Auto));
        assert_eq!("CUDA".parse::<DevicePreference>(), Ok(DevicePreference::Cuda));
        assert_eq!("gpu".parse::<DevicePreference>(), Ok(DevicePreference::Cuda));
        assert_eq!("cpu".parse::<DevicePreference>(), Ok(DevicePreference::Cpu));
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn cpu_preference_never_selects_accelerator() {
        assert_eq!(select_device(DevicePreference::Cpu), Device::Cpu);
    }
}
