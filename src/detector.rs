use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

use crate::model::{DetectorConfig, YoloDetector, BOX_FIELDS};

/// IoU above which a lower-confidence prediction of the same class is suppressed
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.5;

/// A single detection, with the box normalized to 0..1 from the top-left corner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    #[serde(skip)]
    pub class_index: usize,
    pub confidence: f32,
    /// `[x_min, y_min, x_max, y_max]`
    pub bbox: [f32; 4],
}

/// A trained detector together with everything needed to interpret its output
#[derive(Debug)]
pub struct TrainedDetector<B: Backend> {
    pub config: DetectorConfig,
    pub classes: Vec<String>,
    pub model: YoloDetector<B>,
    pub nms_threshold: f32,
}

impl<B: Backend> TrainedDetector<B> {
    pub fn new(config: DetectorConfig, classes: Vec<String>, model: YoloDetector<B>) -> Self {
        Self {
            config,
            classes,
            model,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        }
    }

    /// Run the detector on a batch of images, returning NMS-filtered predictions per image
    pub fn predict_paths(
        &self,
        paths: &[&Path],
        confidence_threshold: f32,
        device: &B::Device,
    ) -> anyhow::Result<Vec<Vec<Prediction>>> {
        let images = load_image_batch::<B>(paths, self.config.input_size, device)?;
        let output = self.model.forward(images);
        let decoded = decode_output(output, &self.config, &self.classes, confidence_threshold)?;
        Ok(decoded
            .into_iter()
            .map(|predictions| non_maximum_suppression(predictions, self.nms_threshold))
            .collect())
    }
}

/// Load an image, stretch it to `size x size` and return normalized CHW pixels
pub fn image_to_chw(path: &Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open image {:?}: {e}", path))?
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let mut chw = vec![0.0f32; 3 * size * size];
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            chw[c * size * size + offset] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(chw)
}

/// Decode a batch of images in parallel into a `[batch, 3, size, size]` tensor
pub fn load_image_batch<B: Backend>(
    paths: &[&Path],
    size: usize,
    device: &B::Device,
) -> anyhow::Result<Tensor<B, 4>> {
    if paths.is_empty() {
        anyhow::bail!("cannot build an empty image batch");
    }
    let pixels = paths
        .par_iter()
        .map(|path| image_to_chw(path, size))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let batch = pixels.len();
    let buf: Vec<f32> = pixels.into_iter().flatten().collect();
    Ok(Tensor::<B, 4>::from_data(
        TensorData::new(buf, [batch, 3, size, size]),
        device,
    ))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Turn raw head output into per-image predictions strictly above `confidence_threshold`.
///
/// Confidence is objectness times the best class probability.
pub fn decode_output<B: Backend>(
    output: Tensor<B, 4>,
    config: &DetectorConfig,
    classes: &[String],
    confidence_threshold: f32,
) -> anyhow::Result<Vec<Vec<Prediction>>> {
    let [batch, channels, grid_h, grid_w] = output.dims();
    if channels != config.output_channels() {
        anyhow::bail!(
            "detector produced {channels} channels, expected {}",
            config.output_channels()
        );
    }
    let data = output
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read detector output: {e:?}"))?;

    let fields = config.fields_per_anchor();
    let cells = grid_h * grid_w;
    let at = |b: usize, a: usize, field: usize, cell: usize| {
        data[(b * channels + a * fields + field) * cells + cell]
    };

    let mut results = Vec::with_capacity(batch);
    for b in 0..batch {
        let mut predictions = Vec::new();
        for (a, anchor) in config.anchors.iter().enumerate() {
            for cell in 0..cells {
                let objectness = sigmoid(at(b, a, 0, cell));

                // softmax over class logits
                let logits: Vec<f32> = (0..config.num_classes)
                    .map(|c| at(b, a, BOX_FIELDS + c, cell))
                    .collect();
                let max_logit = logits.iter().copied().fold(f32::MIN, f32::max);
                let exps: Vec<f32> = logits.iter().map(|l| (l - max_logit).exp()).collect();
                let total: f32 = exps.iter().sum();
                let (class_index, class_prob) = exps
                    .iter()
                    .enumerate()
                    .fold((0, 0.0f32), |best, (i, &e)| {
                        if e / total > best.1 {
                            (i, e / total)
                        } else {
                            best
                        }
                    });

                let confidence = objectness * class_prob;
                if confidence <= confidence_threshold {
                    continue;
                }

                let gx = (cell % grid_w) as f32;
                let gy = (cell / grid_w) as f32;
                let cx = (gx + sigmoid(at(b, a, 1, cell))) / grid_w as f32;
                let cy = (gy + sigmoid(at(b, a, 2, cell))) / grid_h as f32;
                let w = anchor[0] * at(b, a, 3, cell).exp() / grid_w as f32;
                let h = anchor[1] * at(b, a, 4, cell).exp() / grid_h as f32;

                predictions.push(Prediction {
                    label: classes.get(class_index).cloned().unwrap_or_default(),
                    class_index,
                    confidence,
                    bbox: [
                        (cx - w / 2.0).clamp(0.0, 1.0),
                        (cy - h / 2.0).clamp(0.0, 1.0),
                        (cx + w / 2.0).clamp(0.0, 1.0),
                        (cy + h / 2.0).clamp(0.0, 1.0),
                    ],
                });
            }
        }
        results.push(predictions);
    }

    Ok(results)
}

/// Intersection over union of two `[x_min, y_min, x_max, y_max]` boxes
pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Predictions are visited in descending confidence; any later prediction of the same
/// class overlapping a kept one by more than `threshold` IoU is dropped. The result is
/// sorted by descending confidence.
pub fn non_maximum_suppression(mut predictions: Vec<Prediction>, threshold: f32) -> Vec<Prediction> {
    predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = vec![true; predictions.len()];
    for i in 0..predictions.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..predictions.len() {
            if keep[j]
                && predictions[j].class_index == predictions[i].class_index
                && iou_xyxy(predictions[i].bbox, predictions[j].bbox) > threshold
            {
                keep[j] = false;
            }
        }
    }

    predictions
        .into_iter()
        .zip(keep)
        .filter_map(|(prediction, kept)| kept.then_some(prediction))
        .collect()
}
