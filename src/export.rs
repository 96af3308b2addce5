//! Saving, exporting and reloading trained detectors.
//!
//! A saved model is a directory holding `metadata.json` and full-precision weights.
//! An export is a single self-describing file meant for deployment: a magic tag,
//! a little-endian `u32` header length, the JSON header and half-precision weights.

use anyhow::Context;
use burn::module::Module;
use burn::record::{
    BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder,
};
use burn::tensor::backend::Backend;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BaseModel;
use crate::detector::TrainedDetector;
use crate::model::{DetectorConfig, YoloDetector};

pub const EXPORT_MAGIC: &[u8; 4] = b"L2DM";
pub const MODEL_FORMAT_VERSION: u32 = 1;
pub const METADATA_FILE: &str = "metadata.json";
/// Weights file stem inside a saved model directory; the recorder adds `.bin`
pub const WEIGHTS_STEM: &str = "weights";

/// Everything needed to rebuild a detector around its weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,
    pub date_created: String,
    pub base_model: BaseModel,
    /// Class labels, comma separated; kept for display only since labels may contain commas
    pub classes: String,
    /// Class labels in class index order
    pub class_labels: Vec<String>,
    pub non_maximum_suppression_threshold: f32,
    pub input_size: usize,
    pub grid_size: usize,
    pub anchors: Vec<[f32; 2]>,
    pub channels: Vec<usize>,
    pub feature: String,
    pub annotations: String,
}

impl ModelMetadata {
    pub fn from_detector<B: Backend>(detector: &TrainedDetector<B>) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            date_created: Utc::now().to_rfc3339(),
            base_model: detector.config.base_model,
            classes: detector.classes.join(","),
            class_labels: detector.classes.clone(),
            non_maximum_suppression_threshold: detector.nms_threshold,
            input_size: detector.config.input_size,
            grid_size: detector.config.grid_size,
            anchors: detector.config.anchors.clone(),
            channels: detector.config.channels.clone(),
            feature: "image".to_string(),
            annotations: "annotations".to_string(),
        }
    }

    pub fn class_list(&self) -> Vec<String> {
        self.class_labels.clone()
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            base_model: self.base_model,
            num_classes: self.class_list().len(),
            input_size: self.input_size,
            grid_size: self.grid_size,
            anchors: self.anchors.clone(),
            channels: self.channels.clone(),
        }
    }
}

/// Name shared by the saved model and the export: the dataset directory's final component.
///
/// `path` may be the dataset directory or its manifest file.
pub fn model_name_from_dataset_path(path: &Path) -> anyhow::Result<String> {
    let mut dir = if path.is_file() {
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf()
    } else {
        path.to_path_buf()
    };
    if dir.file_name().is_none() {
        dir = dir
            .canonicalize()
            .with_context(|| format!("cannot resolve dataset path {}", path.display()))?;
    }

    dir.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a model name from {}", path.display()))
}

/// Save the detector as a model directory, replacing any existing one
pub fn save_model<B: Backend>(detector: &TrainedDetector<B>, dir: &Path) -> anyhow::Result<PathBuf> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to replace model directory {}", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create model directory {}", dir.display()))?;

    let metadata = ModelMetadata::from_detector(detector);
    fs::write(dir.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)
        .with_context(|| format!("failed to write metadata in {}", dir.display()))?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    detector
        .model
        .clone()
        .save_file(dir.join(WEIGHTS_STEM), &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save weights: {e}"))?;

    Ok(dir.to_path_buf())
}

/// Load a model directory written by [`save_model`]
pub fn load_model<B: Backend>(dir: &Path, device: &B::Device) -> anyhow::Result<TrainedDetector<B>> {
    let metadata_path = dir.join(METADATA_FILE);
    let metadata: ModelMetadata = serde_json::from_slice(
        &fs::read(&metadata_path)
            .with_context(|| format!("failed to read {}", metadata_path.display()))?,
    )
    .with_context(|| format!("invalid model metadata {}", metadata_path.display()))?;

    let config = metadata.detector_config();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = YoloDetector::<B>::new(&config, device)
        .load_file(dir.join(WEIGHTS_STEM), &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load weights from {}: {e}", dir.display()))?;

    Ok(with_metadata(config, &metadata, model))
}

/// Write the single-file deployment export
pub fn export_model<B: Backend>(detector: &TrainedDetector<B>, path: &Path) -> anyhow::Result<()> {
    let metadata = ModelMetadata::from_detector(detector);
    let header = serde_json::to_vec(&metadata)?;
    let header_len = u32::try_from(header.len()).context("export header too large")?;

    let recorder = BinBytesRecorder::<HalfPrecisionSettings>::default();
    let weights: Vec<u8> = recorder
        .record(detector.model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("failed to serialize weights: {e}"))?;

    let mut bytes = Vec::with_capacity(8 + header.len() + weights.len());
    bytes.extend_from_slice(EXPORT_MAGIC);
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&weights);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write export {}", path.display()))
}

/// Split an export file into its metadata header and weight bytes
pub fn read_export_header(bytes: &[u8]) -> anyhow::Result<(ModelMetadata, &[u8])> {
    if bytes.len() < 8 || &bytes[..4] != EXPORT_MAGIC {
        anyhow::bail!("not a detector export (bad magic)");
    }
    let header_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let header_end = 8usize
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .context("truncated export header")?;
    let metadata: ModelMetadata =
        serde_json::from_slice(&bytes[8..header_end]).context("invalid export header")?;
    if metadata.format_version != MODEL_FORMAT_VERSION {
        anyhow::bail!(
            "unsupported export format version {} (expected {})",
            metadata.format_version,
            MODEL_FORMAT_VERSION
        );
    }
    Ok((metadata, &bytes[header_end..]))
}

/// Load a detector from a deployment export
pub fn load_export<B: Backend>(path: &Path, device: &B::Device) -> anyhow::Result<TrainedDetector<B>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (metadata, weights) = read_export_header(&bytes)?;

    let config = metadata.detector_config();
    let recorder = BinBytesRecorder::<HalfPrecisionSettings>::default();
    let record = recorder
        .load(weights.to_vec(), device)
        .map_err(|e| anyhow::anyhow!("failed to decode weights in {}: {e}", path.display()))?;
    let model = YoloDetector::<B>::new(&config, device).load_record(record);

    Ok(with_metadata(config, &metadata, model))
}

fn with_metadata<B: Backend>(
    config: DetectorConfig,
    metadata: &ModelMetadata,
    model: YoloDetector<B>,
) -> TrainedDetector<B> {
    let mut detector = TrainedDetector::new(config, metadata.class_list(), model);
    detector.nms_threshold = metadata.non_maximum_suppression_threshold;
    detector
}
