//! Smoke tests for training, evaluation, saving and exporting on a tiny synthetic dataset.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;

use labelbox2detector::dataset::{DatasetManifest, IMAGES_DIR, MANIFEST_FILE};
use labelbox2detector::detector::{decode_output, iou_xyxy, load_image_batch, non_maximum_suppression};
use labelbox2detector::evaluation::{average_precision, score_predictions};
use labelbox2detector::export::{model_name_from_dataset_path, read_export_header};
use labelbox2detector::model::{DetectorConfig, YoloDetector};
use labelbox2detector::training::{auto_iterations, build_targets, ground_truths, GroundTruth};
use labelbox2detector::{
    evaluate, export_model, load_export, load_model, save_model, train_detector, Annotation,
    BaseModel, Coordinates, Dataset, DatasetRow, Prediction, TrainBackend, TrainedDetector,
    TrainingOptions,
};

/// Write a dataset of `frames` images, each with one bright square on a dark background.
fn create_synthetic_dataset(root: &Path, frames: usize) -> anyhow::Result<()> {
    let images_dir = root.join(IMAGES_DIR);
    fs::create_dir_all(&images_dir)?;

    let mut rows = Vec::new();
    for i in 0..frames {
        let name = format!("frame_{:03}.png", i);
        let (width, height) = (48u32, 32u32);
        let (x0, y0, side) = (4 + (i as u32 % 4) * 6, 6u32, 12u32);

        let mut img = RgbImage::from_pixel(width, height, Rgb([10, 10, 10]));
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        img.save(images_dir.join(&name))?;

        let label = if i % 2 == 0 { "sneaker" } else { "boot" };
        let annotation = Annotation::rectangle(
            Coordinates {
                x: (x0 + side / 2) as f64,
                y: height as f64 - (y0 + side / 2) as f64,
                width: side as f64,
                height: side as f64,
            },
            label,
        );
        rows.push(DatasetRow {
            image: name,
            width,
            height,
            annotations: if i == frames - 1 {
                None
            } else {
                Some(vec![annotation])
            },
        });
    }

    let manifest = DatasetManifest::new(rows);
    fs::write(root.join(MANIFEST_FILE), serde_json::to_vec(&manifest)?)?;
    Ok(())
}

fn device() -> <TrainBackend as Backend>::Device {
    <TrainBackend as Backend>::Device::default()
}

#[test]
fn ground_truths_flip_back_to_top_origin() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_dataset(tmp.path(), 3)?;
    let dataset = Dataset::load(tmp.path())?;

    let truths = ground_truths(&dataset, &dataset.classes());
    assert_eq!(truths.len(), 3);
    assert!(truths[2].is_empty());

    // frame 0: square at x 4..16, y 6..18 in a 48x32 image
    let bbox = truths[0][0].bbox;
    let expected = [4.0 / 48.0, 6.0 / 32.0, 16.0 / 48.0, 18.0 / 32.0];
    for (got, want) in bbox.iter().zip(expected) {
        assert!((got - want).abs() < 1e-5, "{bbox:?} != {expected:?}");
    }
    Ok(())
}

#[test]
fn build_targets_assigns_center_cell() {
    let config = DetectorConfig::new(BaseModel::TinyYolo, 2);
    let truths = vec![vec![GroundTruth {
        class_index: 1,
        bbox: [0.5, 0.5, 0.6, 0.6],
    }]];
    let targets = build_targets(&truths, &config);

    assert_eq!(targets.assigned, 1);
    assert_eq!(targets.obj_mask.iter().filter(|&&v| v == 1.0).count(), 1);
    assert_eq!(targets.noobj_mask.iter().filter(|&&v| v == 0.0).count(), 1);
    assert_eq!(targets.class_one_hot.iter().sum::<f32>(), 1.0);
}

#[test]
fn auto_iterations_cover_several_passes() {
    assert_eq!(auto_iterations(0, 8), 1);
    assert_eq!(auto_iterations(16, 8), 10);
    assert_eq!(auto_iterations(17, 8), 15);
}

#[test]
fn iou_and_nms() {
    assert!((iou_xyxy([0.0, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]) - 1.0).abs() < 1e-6);
    assert_eq!(iou_xyxy([0.0, 0.0, 0.1, 0.1], [0.5, 0.5, 0.6, 0.6]), 0.0);

    let prediction = |class_index: usize, confidence: f32, bbox: [f32; 4]| Prediction {
        label: format!("c{class_index}"),
        class_index,
        confidence,
        bbox,
    };
    let kept = non_maximum_suppression(
        vec![
            prediction(0, 0.7, [0.0, 0.0, 0.5, 0.5]),
            prediction(0, 0.9, [0.02, 0.0, 0.52, 0.5]),
            prediction(1, 0.8, [0.0, 0.0, 0.5, 0.5]),
            prediction(0, 0.6, [0.6, 0.6, 0.9, 0.9]),
        ],
        0.5,
    );

    let confidences: Vec<f32> = kept.iter().map(|p| p.confidence).collect();
    assert_eq!(confidences, vec![0.9, 0.8, 0.6]);
}

#[test]
fn average_precision_edge_cases() {
    assert_eq!(average_precision(&mut [(0.9, true)], 1), 1.0);
    assert_eq!(average_precision(&mut [(0.9, false)], 1), 0.0);
    assert_eq!(average_precision(&mut [], 0), 0.0);
    // one hit out of two truths, found first
    assert!((average_precision(&mut [(0.9, true), (0.4, false)], 2) - 0.5).abs() < 1e-9);
}

#[test]
fn score_predictions_matches_by_class_and_iou() {
    let classes = vec!["boot".to_string(), "sneaker".to_string()];
    let truths = vec![vec![
        GroundTruth {
            class_index: 0,
            bbox: [0.1, 0.1, 0.4, 0.4],
        },
        GroundTruth {
            class_index: 1,
            bbox: [0.5, 0.5, 0.9, 0.9],
        },
    ]];
    let predictions = vec![vec![
        Prediction {
            label: "boot".to_string(),
            class_index: 0,
            confidence: 0.8,
            bbox: [0.1, 0.1, 0.4, 0.4],
        },
        Prediction {
            label: "boot".to_string(),
            class_index: 0,
            confidence: 0.7,
            bbox: [0.5, 0.5, 0.9, 0.9],
        },
    ]];

    let scores = score_predictions(&predictions, &truths, &classes);
    assert_eq!(scores.average_precision_50["boot"], 1.0);
    assert_eq!(scores.average_precision_50["sneaker"], 0.0);
    assert_eq!(scores.mean_average_precision_50, 0.5);
}

#[test]
fn train_evaluate_save_and_export() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dataset_dir = tmp.path().join("shoes");
    create_synthetic_dataset(&dataset_dir, 5)?;
    let dataset = Dataset::load(&dataset_dir)?;
    assert_eq!(dataset.classes(), vec!["boot".to_string(), "sneaker".to_string()]);

    let mut rng = StdRng::seed_from_u64(3);
    let options = TrainingOptions {
        base_model: BaseModel::TinyYolo,
        max_iterations: 2,
        batch_size: 2,
        learning_rate: 1e-3,
    };
    let detector = train_detector(&dataset, dataset.classes(), &options, &mut rng)?;
    assert_eq!(detector.config.grid_size, 13);

    let scores = evaluate(&detector, &dataset, &device())?;
    for ap in scores.average_precision_50.values() {
        assert!((0.0..=1.0).contains(ap));
    }
    assert!((0.0..=1.0).contains(&scores.mean_average_precision_50));

    let name = model_name_from_dataset_path(&dataset_dir)?;
    assert_eq!(name, "shoes");

    let model_dir = tmp.path().join("out").join(format!("{name}.model"));
    save_model(&detector, &model_dir)?;
    let reloaded = load_model::<TrainBackend>(&model_dir, &device())?;
    assert_eq!(reloaded.classes, detector.classes);
    assert_eq!(reloaded.config, detector.config);

    let first = dataset.image_path(&dataset.rows()[0]);
    let batch = load_image_batch::<TrainBackend>(&[first.as_path()], 208, &device())?;
    let original: Vec<f32> = detector.model.forward(batch.clone()).into_data().to_vec().unwrap();
    let restored: Vec<f32> = reloaded.model.forward(batch).into_data().to_vec().unwrap();
    for (a, b) in original.iter().zip(&restored) {
        assert!((a - b).abs() < 1e-4);
    }

    let export_path = tmp.path().join(format!("{name}.mlmodel"));
    export_model(&detector, &export_path)?;
    let bytes = fs::read(&export_path)?;
    let (metadata, weights) = read_export_header(&bytes)?;
    assert_eq!(metadata.classes, "boot,sneaker");
    assert_eq!(metadata.non_maximum_suppression_threshold, 0.5);
    assert!(!weights.is_empty());

    let exported = load_export::<TrainBackend>(&export_path, &device())?;
    assert_eq!(exported.classes, detector.classes);
    assert_eq!(exported.config, detector.config);
    let predictions = exported.predict_paths(&[first.as_path()], 0.0, &device())?;
    assert_eq!(predictions.len(), 1);

    Ok(())
}

#[test]
fn training_rejects_unannotated_dataset() -> anyhow::Result<()> {
    let dataset = Dataset::new(
        "unused",
        vec![DatasetRow {
            image: "a.png".to_string(),
            width: 4,
            height: 4,
            annotations: None,
        }],
    );
    let options = TrainingOptions {
        base_model: BaseModel::TinyYolo,
        max_iterations: 1,
        batch_size: 1,
        learning_rate: 1e-3,
    };
    let result = train_detector(&dataset, dataset.classes(), &options, &mut StdRng::seed_from_u64(0));
    assert!(result.is_err());
    Ok(())
}

#[test]
fn export_header_rejects_garbage() {
    assert!(read_export_header(b"nope").is_err());
    assert!(read_export_header(b"L2DM\xff\xff\x00\x00{}").is_err());
}

#[test]
fn decode_output_requires_confidence_above_threshold() -> anyhow::Result<()> {
    let config = DetectorConfig::new(BaseModel::TinyYolo, 2);
    let classes = vec!["boot".to_string(), "sneaker".to_string()];
    let grid = config.grid_size;
    // all-zero logits: objectness 0.5 times class probability 0.5
    let output = || {
        Tensor::<TrainBackend, 4>::zeros([1, config.output_channels(), grid, grid], &device())
    };

    let at_threshold = decode_output(output(), &config, &classes, 0.25)?;
    assert!(at_threshold[0].is_empty());

    let below = decode_output(output(), &config, &classes, 0.2)?;
    assert_eq!(below[0].len(), config.num_anchors() * grid * grid);
    assert!(below[0].iter().all(|p| (p.confidence - 0.25).abs() < 1e-6));
    Ok(())
}

#[test]
fn class_labels_with_commas_survive_save_and_export() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let classes = vec!["shoe, left".to_string(), "boot".to_string()];
    let config = DetectorConfig::new(BaseModel::TinyYolo, classes.len());
    let model = YoloDetector::<TrainBackend>::new(&config, &device());
    let detector = TrainedDetector::new(config.clone(), classes.clone(), model);

    let model_dir = tmp.path().join("shoes.model");
    save_model(&detector, &model_dir)?;
    let saved = load_model::<TrainBackend>(&model_dir, &device())?;
    assert_eq!(saved.classes, classes);
    assert_eq!(saved.config.num_classes, 2);

    let export_path = tmp.path().join("shoes.mlmodel");
    export_model(&detector, &export_path)?;
    let (metadata, _) = read_export_header(&fs::read(&export_path)?)?;
    assert_eq!(metadata.classes, "shoe, left,boot");
    assert_eq!(metadata.class_labels, classes);

    let exported = load_export::<TrainBackend>(&export_path, &device())?;
    assert_eq!(exported.classes, classes);
    assert_eq!(exported.config, config);
    Ok(())
}
