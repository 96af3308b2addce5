use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::activation::{log_softmax, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;

use crate::config::BaseModel;
use crate::dataset::Dataset;
use crate::detector::{load_image_batch, TrainedDetector};
use crate::model::{DetectorConfig, YoloDetector, BOX_FIELDS};
use crate::utils::create_progress_bar;

/// Backend used for training and evaluation
pub type TrainBackend = burn_ndarray::NdArray<f32>;
type ADBackend = Autodiff<TrainBackend>;

// Loss weights for box regression and for cells that should contain nothing
const LAMBDA_COORD: f32 = 5.0;
const LAMBDA_NOOBJ: f32 = 0.5;
const EPS: f32 = 1e-6;

/// Passes over the training rows used when no iteration count is given
pub const AUTO_PASSES: usize = 5;

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub base_model: BaseModel,
    /// Optimizer steps to run; 0 picks [`auto_iterations`]
    pub max_iterations: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
}

/// One ground-truth box of a training image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub class_index: usize,
    /// `[x_min, y_min, x_max, y_max]` normalized, top-left origin
    pub bbox: [f32; 4],
}

/// Ground-truth boxes for every row, with labels mapped to indices into `classes`.
///
/// Skipped rows yield an empty list and train as background images; labels missing
/// from `classes` are dropped.
pub fn ground_truths(dataset: &Dataset, classes: &[String]) -> Vec<Vec<GroundTruth>> {
    dataset
        .rows()
        .iter()
        .map(|row| {
            row.annotations
                .iter()
                .flatten()
                .filter_map(|annotation| {
                    let class_index = classes.iter().position(|c| c == &annotation.label)?;
                    Some(GroundTruth {
                        class_index,
                        bbox: annotation.to_normalized_xyxy(row.size()),
                    })
                })
                .collect()
        })
        .collect()
}

/// Number of iterations covering [`AUTO_PASSES`] passes over `rows` rows
pub fn auto_iterations(rows: usize, batch_size: usize) -> usize {
    let batches_per_pass = rows.div_ceil(batch_size.max(1));
    (AUTO_PASSES * batches_per_pass).max(1)
}

fn wh_iou(a: [f32; 2], b: [f32; 2]) -> f32 {
    let inter = a[0].min(b[0]) * a[1].min(b[1]);
    let union = a[0] * a[1] + b[0] * b[1] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Dense training targets laid out like the reshaped head output `[batch, anchors, field, grid, grid]`
#[derive(Debug, Clone)]
pub struct YoloTargets {
    pub xy: Vec<f32>,
    pub wh: Vec<f32>,
    pub coord_mask: Vec<f32>,
    pub obj_mask: Vec<f32>,
    pub noobj_mask: Vec<f32>,
    pub class_one_hot: Vec<f32>,
    pub assigned: usize,
}

/// Assign every ground-truth box to the cell holding its center and the anchor whose
/// shape fits it best. A later box assigned to the same slot replaces an earlier one.
pub fn build_targets(truths: &[Vec<GroundTruth>], config: &DetectorConfig) -> YoloTargets {
    let batch = truths.len();
    let anchors = config.num_anchors();
    let grid = config.grid_size;
    let classes = config.num_classes;
    let cells = grid * grid;

    let mut targets = YoloTargets {
        xy: vec![0.0; batch * anchors * 2 * cells],
        wh: vec![0.0; batch * anchors * 2 * cells],
        coord_mask: vec![0.0; batch * anchors * 2 * cells],
        obj_mask: vec![0.0; batch * anchors * cells],
        noobj_mask: vec![1.0; batch * anchors * cells],
        class_one_hot: vec![0.0; batch * anchors * classes * cells],
        assigned: 0,
    };
    let idx = |b: usize, a: usize, field: usize, fields: usize, cell: usize| {
        ((b * anchors + a) * fields + field) * cells + cell
    };

    for (b, boxes) in truths.iter().enumerate() {
        for truth in boxes {
            let [x0, y0, x1, y1] = truth.bbox;
            let w = (x1 - x0).abs() * grid as f32;
            let h = (y1 - y0).abs() * grid as f32;
            if w <= EPS || h <= EPS {
                continue;
            }
            let cx = ((x0 + x1) / 2.0 * grid as f32).clamp(0.0, grid as f32 - EPS);
            let cy = ((y0 + y1) / 2.0 * grid as f32).clamp(0.0, grid as f32 - EPS);
            let gx = cx.floor() as usize;
            let gy = cy.floor() as usize;
            let cell = gy * grid + gx;

            let (a, anchor) = config
                .anchors
                .iter()
                .enumerate()
                .map(|(a, anchor)| (a, *anchor))
                .fold((0, config.anchors[0]), |best, (a, anchor)| {
                    if wh_iou([w, h], anchor) > wh_iou([w, h], best.1) {
                        (a, anchor)
                    } else {
                        best
                    }
                });

            targets.xy[idx(b, a, 0, 2, cell)] = cx - gx as f32;
            targets.xy[idx(b, a, 1, 2, cell)] = cy - gy as f32;
            targets.wh[idx(b, a, 0, 2, cell)] = (w / anchor[0]).ln();
            targets.wh[idx(b, a, 1, 2, cell)] = (h / anchor[1]).ln();
            targets.coord_mask[idx(b, a, 0, 2, cell)] = 1.0;
            targets.coord_mask[idx(b, a, 1, 2, cell)] = 1.0;
            targets.obj_mask[idx(b, a, 0, 1, cell)] = 1.0;
            targets.noobj_mask[idx(b, a, 0, 1, cell)] = 0.0;
            for c in 0..classes {
                targets.class_one_hot[idx(b, a, c, classes, cell)] =
                    if c == truth.class_index { 1.0 } else { 0.0 };
            }
            targets.assigned += 1;
        }
    }

    targets
}

/// YOLO loss: squared error on box offsets, binary cross-entropy on objectness and
/// cross-entropy on classes, averaged over the batch.
pub fn yolo_loss<B: Backend>(
    output: Tensor<B, 4>,
    truths: &[Vec<GroundTruth>],
    config: &DetectorConfig,
) -> Tensor<B, 1> {
    let [batch, _, grid_h, grid_w] = output.dims();
    let anchors = config.num_anchors();
    let fields = config.fields_per_anchor();
    let classes = config.num_classes;
    let device = output.device();

    let out = output.reshape([batch, anchors, fields, grid_h, grid_w]);
    let pred_obj = sigmoid(out.clone().slice([0..batch, 0..anchors, 0..1, 0..grid_h, 0..grid_w]))
        .clamp(EPS, 1.0 - EPS);
    let pred_xy = sigmoid(out.clone().slice([0..batch, 0..anchors, 1..3, 0..grid_h, 0..grid_w]));
    let pred_wh = out
        .clone()
        .slice([0..batch, 0..anchors, 3..BOX_FIELDS, 0..grid_h, 0..grid_w]);
    let pred_cls = log_softmax(
        out.slice([0..batch, 0..anchors, BOX_FIELDS..fields, 0..grid_h, 0..grid_w]),
        2,
    );

    let targets = build_targets(truths, config);
    let pair_shape = [batch, anchors, 2, grid_h, grid_w];
    let single_shape = [batch, anchors, 1, grid_h, grid_w];
    let class_shape = [batch, anchors, classes, grid_h, grid_w];
    let tensor = |values: Vec<f32>, shape: [usize; 5]| {
        Tensor::<B, 5>::from_data(TensorData::new(values, shape), &device)
    };

    let t_xy = tensor(targets.xy, pair_shape);
    let t_wh = tensor(targets.wh, pair_shape);
    let coord_mask = tensor(targets.coord_mask, pair_shape);
    let obj_mask = tensor(targets.obj_mask, single_shape);
    let noobj_mask = tensor(targets.noobj_mask, single_shape);
    let t_cls = tensor(targets.class_one_hot, class_shape);

    let xy_err = pred_xy - t_xy;
    let wh_err = pred_wh - t_wh;
    let coord_loss = (xy_err.clone() * xy_err * coord_mask.clone()).sum()
        + (wh_err.clone() * wh_err * coord_mask).sum();

    let obj_loss = (pred_obj.clone().log() * obj_mask).sum().neg();
    let noobj_loss = (pred_obj.neg().add_scalar(1.0).log() * noobj_mask)
        .sum()
        .neg();
    let class_loss = (pred_cls * t_cls).sum().neg();

    (coord_loss.mul_scalar(LAMBDA_COORD) + obj_loss + noobj_loss.mul_scalar(LAMBDA_NOOBJ) + class_loss)
        .div_scalar(batch.max(1) as f32)
}

/// Train a detector from scratch on `train`.
///
/// Rows are reshuffled at the start of every pass; training stops after exactly the
/// configured number of iterations.
pub fn train_detector(
    train: &Dataset,
    classes: Vec<String>,
    options: &TrainingOptions,
    rng: &mut StdRng,
) -> anyhow::Result<TrainedDetector<TrainBackend>> {
    if train.is_empty() {
        anyhow::bail!("training split is empty; nothing to train on");
    }
    if classes.is_empty() {
        anyhow::bail!("dataset has no annotations; nothing to train on");
    }

    let device = <ADBackend as Backend>::Device::default();
    let config = DetectorConfig::new(options.base_model, classes.len());
    let mut model = YoloDetector::<ADBackend>::new(&config, &device);
    let mut optim = AdamConfig::new().init();

    let batch_size = options.batch_size.max(1);
    let iterations = if options.max_iterations == 0 {
        let auto = auto_iterations(train.len(), batch_size);
        info!("Automatically picked {} training iterations", auto);
        auto
    } else {
        options.max_iterations
    };

    info!(
        "Training {} on {} rows ({} classes, input {}x{}, batch {})",
        config.base_model,
        train.len(),
        classes.len(),
        config.input_size,
        config.input_size,
        batch_size
    );

    let truths = ground_truths(train, &classes);
    let image_paths: Vec<_> = train.rows().iter().map(|row| train.image_path(row)).collect();
    let mut order: Vec<usize> = (0..train.len()).collect();

    let pb = create_progress_bar(iterations as u64, "Train");
    let mut iteration = 0;
    let mut running_loss = 0.0f32;
    while iteration < iterations {
        order.shuffle(&mut *rng);
        for chunk in order.chunks(batch_size) {
            if iteration >= iterations {
                break;
            }
            let paths: Vec<&Path> = chunk.iter().map(|&i| image_paths[i].as_path()).collect();
            let batch_truths: Vec<Vec<GroundTruth>> =
                chunk.iter().map(|&i| truths[i].clone()).collect();

            let images = load_image_batch::<ADBackend>(&paths, config.input_size, &device)?;
            let output = model.forward(images);
            let loss = yolo_loss(output, &batch_truths, &config);
            let loss_detached = loss.clone().detach();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(options.learning_rate, model, grads);

            let loss_val: f32 = loss_detached
                .into_data()
                .to_vec::<f32>()
                .unwrap_or_default()
                .into_iter()
                .next()
                .unwrap_or(0.0);
            running_loss = if iteration == 0 {
                loss_val
            } else {
                0.9 * running_loss + 0.1 * loss_val
            };
            iteration += 1;
            pb.inc(1);
            debug!("iteration {iteration}: loss {loss_val:.4}");
            if iteration % 10 == 0 || iteration == iterations {
                pb.set_message(format!("loss {running_loss:.4}"));
                info!("iteration {iteration}/{iterations}: smoothed loss {running_loss:.4}");
            }
        }
    }
    pb.finish_with_message("Training complete");

    Ok(TrainedDetector::new(config, classes, model.valid()))
}
