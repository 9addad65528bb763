//! Network asset identity, loading, and output binding.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::engine::{InferenceEngine, ModelInstance};
use crate::types::TensorDtype;

/// Channels in the packed network input tensor.
pub const INPUT_CHANNELS: usize = 12;
/// Channels in each network output tensor.
pub const OUTPUT_CHANNELS: usize = 4;
/// Every supported network produces exactly six outputs.
pub const OUTPUT_TENSOR_COUNT: usize = 6;

/// Numeric flavor of a network, derived from its input element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPrecision {
    Quantized8,
    Float32,
}

impl ModelPrecision {
    /// Single-byte input elements mean a quantized network; anything wider
    /// is treated as float.
    pub fn from_input_element_size(bytes: usize) -> Self {
        if bytes == 1 {
            ModelPrecision::Quantized8
        } else {
            ModelPrecision::Float32
        }
    }

    pub fn input_dtype(&self) -> TensorDtype {
        match self {
            ModelPrecision::Quantized8 => TensorDtype::U8,
            ModelPrecision::Float32 => TensorDtype::F32,
        }
    }

    pub fn output_dtype(&self) -> TensorDtype {
        self.input_dtype()
    }

    pub fn bytes_per_output_pixel(&self) -> usize {
        OUTPUT_CHANNELS * self.output_dtype().element_size()
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelPrecision::Quantized8 => "Quantized 8-bit",
            ModelPrecision::Float32 => "float32",
        }
    }
}

/// Semantic identity of one of the six network outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTensor {
    Feedback,
    ThetaAlpha,
    KpnFilterCol0,
    KpnFilterCol1,
    KpnFilterCol2,
    KpnFilterCol3,
}

impl OutputTensor {
    pub const ALL: [OutputTensor; OUTPUT_TENSOR_COUNT] = [
        OutputTensor::Feedback,
        OutputTensor::ThetaAlpha,
        OutputTensor::KpnFilterCol0,
        OutputTensor::KpnFilterCol1,
        OutputTensor::KpnFilterCol2,
        OutputTensor::KpnFilterCol3,
    ];

    pub fn ordinal(self) -> usize {
        match self {
            OutputTensor::Feedback => 0,
            OutputTensor::ThetaAlpha => 1,
            OutputTensor::KpnFilterCol0 => 2,
            OutputTensor::KpnFilterCol1 => 3,
            OutputTensor::KpnFilterCol2 => 4,
            OutputTensor::KpnFilterCol3 => 5,
        }
    }
}

/// Maps each semantic output to its positional slot in the network's output
/// list. Exactly two layouts exist, keyed on precision; quantized and float
/// exports order their heads in exact reverse of one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputIndexTable {
    slots: [usize; OUTPUT_TENSOR_COUNT],
}

impl OutputIndexTable {
    pub fn for_precision(precision: ModelPrecision) -> Self {
        // Indexed by OutputTensor::ordinal().
        let slots = match precision {
            ModelPrecision::Quantized8 => [0, 1, 5, 4, 3, 2],
            ModelPrecision::Float32 => [5, 4, 0, 1, 2, 3],
        };
        Self { slots }
    }

    pub fn slot(&self, tensor: OutputTensor) -> usize {
        self.slots[tensor.ordinal()]
    }

    /// Inverse lookup: which semantic tensor lives at positional `slot`.
    pub fn tensor_at_slot(&self, slot: usize) -> Option<OutputTensor> {
        OutputTensor::ALL
            .into_iter()
            .find(|tensor| self.slot(*tensor) == slot)
    }
}

/// One entry in the model catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    /// Hex sha256 of the asset file; verified at load when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Known network assets, resolved relative to a models directory.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

pub const CATALOG_FILE_NAME: &str = "catalog.json";

impl ModelCatalog {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            entries: Vec::new(),
        }
    }

    /// Catalog seeded with the stock float and quantized exports, merged
    /// with `catalog.json` in the models directory when present.
    pub fn with_builtin(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut catalog = Self::new(models_dir);
        catalog.register(ModelEntry {
            name: "tempra-tss-fp32".to_string(),
            filename: "tempra_tss_fp32.onnx".to_string(),
            sha256: None,
            description: "float32 temporal super-sampling network".to_string(),
        });
        catalog.register(ModelEntry {
            name: "tempra-tss-int8".to_string(),
            filename: "tempra_tss_int8.onnx".to_string(),
            sha256: None,
            description: "quantized temporal super-sampling network".to_string(),
        });
        let catalog_path = catalog.models_dir.join(CATALOG_FILE_NAME);
        if catalog_path.exists() {
            catalog.merge_file(&catalog_path)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, entry: ModelEntry) {
        self.entries.retain(|existing| existing.name != entry.name);
        self.entries.push(entry);
    }

    /// Merges entries from a JSON catalog file; same-name entries override.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read model catalog {}", path.display()))?;
        let entries: Vec<ModelEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("parse model catalog {}", path.display()))?;
        for entry in entries {
            self.register(entry);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn model_path(&self, entry: &ModelEntry) -> PathBuf {
        self.models_dir.join(&entry.filename)
    }
}

/// Hex sha256 of a file, streamed in 8 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

/// A network bound to an engine, with its precision and output routing
/// settled at load time.
#[derive(Clone)]
pub struct LoadedModel {
    pub name: String,
    pub instance: Arc<Mutex<Box<dyn ModelInstance>>>,
    pub precision: ModelPrecision,
    pub output_table: OutputIndexTable,
}

/// Resolves `name` through the catalog, verifies its digest when the entry
/// carries one, and loads it on `engine`.
pub fn load_model(
    engine: &dyn InferenceEngine,
    catalog: &ModelCatalog,
    name: &str,
) -> Result<LoadedModel> {
    let entry = catalog
        .get(name)
        .with_context(|| format!("model '{name}' is not in the catalog"))?;
    let path = catalog.model_path(entry);

    if let Some(expected) = &entry.sha256 {
        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            bail!(
                "model '{}' digest mismatch: expected {expected}, got {actual}",
                entry.name
            );
        }
    }

    let instance = engine
        .load(&path)
        .with_context(|| format!("load model '{}' on engine '{}'", entry.name, engine.name()))?;
    let descriptor = instance.descriptor();
    if descriptor.output_count != OUTPUT_TENSOR_COUNT {
        bail!(
            "model '{}' exposes {} outputs, expected {OUTPUT_TENSOR_COUNT}",
            entry.name,
            descriptor.output_count
        );
    }

    let precision = ModelPrecision::from_input_element_size(descriptor.input_element_size);
    info!(
        model = %entry.name,
        engine = engine.name(),
        precision = precision.label(),
        "model loaded"
    );
    Ok(LoadedModel {
        name: entry.name.clone(),
        instance: Arc::new(Mutex::new(instance)),
        precision,
        output_table: OutputIndexTable::for_precision(precision),
    })
}
