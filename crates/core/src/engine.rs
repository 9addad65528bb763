//! Pluggable inference engines.
//!
//! An engine turns a model asset on disk into a [`ModelInstance`] the frame
//! pipeline can run. The default registry carries the ORT engine (CUDA EP,
//! optional TensorRT EP with engine caching) and a deterministic null engine
//! for harness and test use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};

use crate::model::{ModelPrecision, INPUT_CHANNELS, OUTPUT_CHANNELS, OUTPUT_TENSOR_COUNT};
use crate::types::{TensorBuf, TensorDtype};

pub const DEFAULT_ENGINE: &str = "ort";

/// Shape facts introspected from a loaded network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub input_element_size: usize,
    pub output_count: usize,
}

/// A loaded network ready to run. Instances are stateful: the input shape is
/// configured lazily on first use and re-applied only when it changes.
pub trait ModelInstance: Send {
    fn descriptor(&self) -> ModelDescriptor;

    fn input_shape(&self) -> Option<[usize; 4]>;

    fn set_input_shape(&mut self, shape: [usize; 4]) -> Result<()>;

    /// Shape of positional output `slot` under the configured input shape.
    fn output_shape(&self, slot: usize) -> Result<[usize; 4]>;

    /// Runs one inference. `outputs[slot]` receives the raw positional
    /// output; semantic routing is the caller's concern.
    fn run(&mut self, input: &TensorBuf, outputs: &mut [TensorBuf]) -> Result<()>;
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, model_path: &Path) -> Result<Box<dyn ModelInstance>>;
}

/// Engines available to the driver, keyed by name.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn InferenceEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn InferenceEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn InferenceEngine>> {
        self.engines.get(name).cloned().with_context(|| {
            format!(
                "unknown inference engine '{name}' (available: {})",
                self.names().join(", ")
            )
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Registry with the stock engines installed.
pub fn build_default_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(OrtEngine::default()));
    registry.register(Arc::new(NullEngine::new()));
    registry
}

// ---------------------------------------------------------------------------
// ORT engine
// ---------------------------------------------------------------------------

/// Execution provider preference. TensorRT falls back to CUDA when the TRT
/// runtime libraries are not installed; CUDA falls back to CPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ExecutionPreference {
    #[default]
    Cuda,
    Tensorrt,
}

impl ExecutionPreference {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

#[derive(Default)]
pub struct OrtEngine {
    pub preference: ExecutionPreference,
}

impl OrtEngine {
    fn build_session(&self, model_path: &Path) -> Result<Session> {
        let builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        let session = match self.preference {
            ExecutionPreference::Tensorrt => {
                let cache_dir = Path::new("trt_cache");
                if let Err(error) = std::fs::create_dir_all(cache_dir) {
                    warn!(
                        dir = %cache_dir.display(),
                        error = %error,
                        "failed to create TRT engine cache directory"
                    );
                }
                debug!(
                    backend = "tensorrt",
                    cache_dir = %cache_dir.display(),
                    "building session with TensorRT EP (CUDA EP fallback)"
                );
                // TRT EP may fail at runtime if libnvinfer is not installed;
                // the CUDA EP entry keeps inference working.
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(cache_dir.to_string_lossy())
                            .with_fp16(true)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build(),
                    ])?
                    .commit_from_file(model_path)
                    .with_context(|| {
                        format!("failed to load ONNX model: {}", model_path.display())
                    })?
            }
            ExecutionPreference::Cuda => {
                let cuda = CUDAExecutionProvider::default();
                if !cuda.is_available().unwrap_or(false) {
                    warn!("CUDA EP is not available, inference will fall back to CPU");
                }
                debug!(backend = "cuda", "building session with CUDA EP");
                builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])?
                    .commit_from_file(model_path)
                    .with_context(|| {
                        format!("failed to load ONNX model: {}", model_path.display())
                    })?
            }
        };

        Ok(session)
    }
}

impl InferenceEngine for OrtEngine {
    fn name(&self) -> &'static str {
        "ort"
    }

    fn load(&self, model_path: &Path) -> Result<Box<dyn ModelInstance>> {
        let session = self.build_session(model_path)?;

        let input_name = session.inputs()[0].name().to_string();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        let input_element_size = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                if *ty == ort::tensor::TensorElementType::Uint8 {
                    1
                } else {
                    4
                }
            }
            _ => 4,
        };

        info!(
            model = %model_path.display(),
            %input_name,
            outputs = output_names.len(),
            input_element_size,
            "ORT session ready"
        );

        Ok(Box::new(OrtModel {
            session,
            input_name,
            output_names,
            input_element_size,
            input_shape: None,
        }))
    }
}

struct OrtModel {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    input_element_size: usize,
    input_shape: Option<[usize; 4]>,
}

impl ModelInstance for OrtModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            input_element_size: self.input_element_size,
            output_count: self.output_names.len(),
        }
    }

    fn input_shape(&self) -> Option<[usize; 4]> {
        self.input_shape
    }

    fn set_input_shape(&mut self, shape: [usize; 4]) -> Result<()> {
        if shape[0] != 1 || shape[3] != INPUT_CHANNELS {
            bail!(
                "unsupported input shape {shape:?}, expected [1, H, W, {INPUT_CHANNELS}]"
            );
        }
        self.input_shape = Some(shape);
        Ok(())
    }

    fn output_shape(&self, slot: usize) -> Result<[usize; 4]> {
        if slot >= self.output_names.len() {
            bail!("output slot {slot} out of range");
        }
        let shape = self
            .input_shape
            .context("input shape has not been configured")?;
        // Outputs track the fed input spatially; `run` checks the tensors
        // the session actually produced against this.
        Ok([1, shape[1], shape[2], OUTPUT_CHANNELS])
    }

    fn run(&mut self, input: &TensorBuf, outputs: &mut [TensorBuf]) -> Result<()> {
        let shape = self
            .input_shape
            .context("input shape has not been configured")?;
        if input.shape != shape {
            bail!(
                "input tensor shape {:?} does not match configured {shape:?}",
                input.shape
            );
        }
        let dims = (shape[0], shape[1], shape[2], shape[3]);

        match input.dtype {
            TensorDtype::U8 => {
                let array = Array4::<u8>::from_shape_vec(dims, input.data.clone())
                    .context("shape input tensor")?;
                let tensor = Tensor::from_array(array)?;
                let session_outputs = self
                    .session
                    .run(ort::inputs![self.input_name.as_str() => &tensor])?;
                for (slot, name) in self.output_names.iter().enumerate() {
                    let view = session_outputs[name.as_str()].try_extract_array::<u8>()?;
                    check_output_shape(name, view.shape(), outputs[slot].shape)?;
                    let owned = view.as_standard_layout();
                    let data = owned
                        .as_slice()
                        .context("output tensor is not contiguous")?;
                    outputs[slot].copy_from_u8(data);
                }
            }
            TensorDtype::F32 => {
                let array = Array4::<f32>::from_shape_vec(dims, input.as_f32_vec())
                    .context("shape input tensor")?;
                let tensor = Tensor::from_array(array)?;
                let session_outputs = self
                    .session
                    .run(ort::inputs![self.input_name.as_str() => &tensor])?;
                for (slot, name) in self.output_names.iter().enumerate() {
                    let view = session_outputs[name.as_str()].try_extract_array::<f32>()?;
                    check_output_shape(name, view.shape(), outputs[slot].shape)?;
                    let owned = view.as_standard_layout();
                    let data = owned
                        .as_slice()
                        .context("output tensor is not contiguous")?;
                    outputs[slot].copy_from_f32(data);
                }
            }
        }
        Ok(())
    }
}

/// A network whose outputs do not track the fed input spatially must fail
/// the frame instead of corrupting the destination buffers.
fn check_output_shape(name: &str, actual: &[usize], expected: [usize; 4]) -> Result<()> {
    if actual != expected.as_slice() {
        bail!("network output '{name}' has shape {actual:?}, expected {expected:?}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Null engine
// ---------------------------------------------------------------------------

/// Deterministic engine that ignores the model file and produces all-zero
/// outputs. Used by the replay harness for machines without a GPU runtime
/// and by tests that need inference without weights.
pub struct NullEngine {
    precision: ModelPrecision,
    output_count: usize,
    misreport_output_shape: bool,
    shape_sets: Arc<AtomicUsize>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self {
            precision: ModelPrecision::Float32,
            output_count: OUTPUT_TENSOR_COUNT,
            misreport_output_shape: false,
            shape_sets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_precision(mut self, precision: ModelPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_output_count(mut self, output_count: usize) -> Self {
        self.output_count = output_count;
        self
    }

    /// Makes every instance report a wrong channel count for its outputs,
    /// for exercising the frame pipeline's shape validation.
    pub fn with_bad_output_shape(mut self) -> Self {
        self.misreport_output_shape = true;
        self
    }

    /// Counts `set_input_shape` calls across all instances this engine
    /// loads, for asserting lazy shape configuration.
    pub fn shape_set_probe(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shape_sets)
    }
}

impl Default for NullEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for NullEngine {
    fn name(&self) -> &'static str {
        "null"
    }

    fn load(&self, _model_path: &Path) -> Result<Box<dyn ModelInstance>> {
        Ok(Box::new(NullModel {
            precision: self.precision,
            output_count: self.output_count,
            misreport_output_shape: self.misreport_output_shape,
            input_shape: None,
            shape_sets: Arc::clone(&self.shape_sets),
        }))
    }
}

struct NullModel {
    precision: ModelPrecision,
    output_count: usize,
    misreport_output_shape: bool,
    input_shape: Option<[usize; 4]>,
    shape_sets: Arc<AtomicUsize>,
}

impl ModelInstance for NullModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            input_element_size: self.precision.input_dtype().element_size(),
            output_count: self.output_count,
        }
    }

    fn input_shape(&self) -> Option<[usize; 4]> {
        self.input_shape
    }

    fn set_input_shape(&mut self, shape: [usize; 4]) -> Result<()> {
        if shape[0] != 1 || shape[3] != INPUT_CHANNELS {
            bail!(
                "unsupported input shape {shape:?}, expected [1, H, W, {INPUT_CHANNELS}]"
            );
        }
        self.input_shape = Some(shape);
        self.shape_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn output_shape(&self, slot: usize) -> Result<[usize; 4]> {
        if slot >= self.output_count {
            bail!("output slot {slot} out of range");
        }
        let shape = self
            .input_shape
            .context("input shape has not been configured")?;
        let channels = if self.misreport_output_shape {
            OUTPUT_CHANNELS + 1
        } else {
            OUTPUT_CHANNELS
        };
        Ok([1, shape[1], shape[2], channels])
    }

    fn run(&mut self, input: &TensorBuf, outputs: &mut [TensorBuf]) -> Result<()> {
        let shape = self
            .input_shape
            .context("input shape has not been configured")?;
        if input.shape != shape {
            bail!(
                "input tensor shape {:?} does not match configured {shape:?}",
                input.shape
            );
        }
        for output in outputs.iter_mut() {
            output.data.fill(0);
        }
        Ok(())
    }
}
