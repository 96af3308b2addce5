use burn::tensor::backend::Backend;
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::dataset::Dataset;
use crate::detector::{iou_xyxy, Prediction, TrainedDetector};
use crate::training::{ground_truths, GroundTruth};
use crate::utils::create_progress_bar;

/// IoU a prediction needs with a ground-truth box to count as a true positive
pub const MATCH_IOU: f32 = 0.5;
/// Predictions below this confidence are not scored at all
pub const EVAL_CONFIDENCE_THRESHOLD: f32 = 0.001;
const EVAL_BATCH_SIZE: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationScores {
    pub average_precision_50: BTreeMap<String, f64>,
    pub mean_average_precision_50: f64,
}

/// All-point interpolated average precision.
///
/// `hits` lists every prediction of one class as `(confidence, true_positive)`;
/// `num_truths` is the number of ground-truth boxes of that class.
pub fn average_precision(hits: &mut [(f32, bool)], num_truths: usize) -> f64 {
    if num_truths == 0 {
        return 0.0;
    }
    hits.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut recall = Vec::with_capacity(hits.len() + 2);
    let mut precision = Vec::with_capacity(hits.len() + 2);
    recall.push(0.0);
    precision.push(0.0);

    let (mut tp, mut fp) = (0usize, 0usize);
    for &(_, hit) in hits.iter() {
        if hit {
            tp += 1;
        } else {
            fp += 1;
        }
        recall.push(tp as f64 / num_truths as f64);
        precision.push(tp as f64 / (tp + fp) as f64);
    }
    recall.push(1.0);
    precision.push(0.0);

    // make precision monotonically decreasing from the right
    for i in (0..precision.len() - 1).rev() {
        precision[i] = precision[i].max(precision[i + 1]);
    }

    recall
        .windows(2)
        .zip(precision.iter().skip(1))
        .map(|(r, p)| (r[1] - r[0]) * p)
        .sum()
}

/// Score predictions against ground truth, one inner vector per image.
///
/// Classes with no ground-truth boxes are left out of the mean.
pub fn score_predictions(
    predictions: &[Vec<Prediction>],
    truths: &[Vec<GroundTruth>],
    classes: &[String],
) -> EvaluationScores {
    let mut hits: Vec<Vec<(f32, bool)>> = vec![Vec::new(); classes.len()];
    let mut num_truths = vec![0usize; classes.len()];

    for (image_predictions, image_truths) in predictions.iter().zip(truths) {
        for truth in image_truths {
            if let Some(count) = num_truths.get_mut(truth.class_index) {
                *count += 1;
            }
        }

        let mut sorted: Vec<&Prediction> = image_predictions.iter().collect();
        sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut matched = vec![false; image_truths.len()];
        for prediction in sorted {
            if prediction.class_index >= classes.len() {
                continue;
            }
            let best = image_truths
                .iter()
                .enumerate()
                .filter(|(i, truth)| truth.class_index == prediction.class_index && !matched[*i])
                .map(|(i, truth)| (i, iou_xyxy(prediction.bbox, truth.bbox)))
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let hit = match best {
                Some((i, iou)) if iou >= MATCH_IOU => {
                    matched[i] = true;
                    true
                }
                _ => false,
            };
            hits[prediction.class_index].push((prediction.confidence, hit));
        }
    }

    let mut scores = EvaluationScores::default();
    let mut total = 0.0;
    let mut scored = 0usize;
    for (c, class) in classes.iter().enumerate() {
        if num_truths[c] == 0 {
            continue;
        }
        let ap = average_precision(&mut hits[c], num_truths[c]);
        scores.average_precision_50.insert(class.clone(), ap);
        total += ap;
        scored += 1;
    }
    scores.mean_average_precision_50 = if scored > 0 {
        total / scored as f64
    } else {
        0.0
    };
    scores
}

/// Evaluate a detector on every row of `dataset`
pub fn evaluate<B: Backend>(
    detector: &TrainedDetector<B>,
    dataset: &Dataset,
    device: &B::Device,
) -> anyhow::Result<EvaluationScores> {
    let truths = ground_truths(dataset, &detector.classes);
    let image_paths: Vec<_> = dataset
        .rows()
        .iter()
        .map(|row| dataset.image_path(row))
        .collect();

    let pb = create_progress_bar(image_paths.len() as u64, "Eval");
    let mut predictions = Vec::with_capacity(image_paths.len());
    for chunk in image_paths.chunks(EVAL_BATCH_SIZE) {
        let paths: Vec<&Path> = chunk.iter().map(|p| p.as_path()).collect();
        predictions.extend(detector.predict_paths(&paths, EVAL_CONFIDENCE_THRESHOLD, device)?);
        pb.inc(chunk.len() as u64);
    }
    pb.finish_with_message("Evaluation complete");

    let scores = score_predictions(&predictions, &truths, &detector.classes);
    info!(
        "mean_average_precision_50: {:.4} over {} rows",
        scores.mean_average_precision_50,
        dataset.len()
    );
    Ok(scores)
}
