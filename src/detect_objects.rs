use clap::Parser;
use log::{error, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use labelbox2detector::{load_export, DetectArgs, Prediction, TrainBackend};

#[derive(Serialize)]
struct ImagePredictions {
    image: PathBuf,
    predictions: Vec<Prediction>,
}

fn run(args: &DetectArgs) -> anyhow::Result<()> {
    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let detector = load_export::<TrainBackend>(&args.model, &device)?;
    info!(
        "Loaded {} detector with classes {:?}",
        detector.config.base_model, detector.classes
    );

    for image in &args.images {
        let paths: Vec<&Path> = vec![image.as_path()];
        let mut predictions = detector
            .predict_paths(&paths, args.confidence_threshold as f32, &device)?
            .pop()
            .unwrap_or_default();
        predictions.truncate(args.max_predictions);

        let result = ImagePredictions {
            image: image.clone(),
            predictions,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = DetectArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Detection failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
