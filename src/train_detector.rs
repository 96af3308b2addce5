use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::process::ExitCode;

use labelbox2detector::export::model_name_from_dataset_path;
use labelbox2detector::{
    evaluate, export_model, save_model, train_detector, Dataset, TrainArgs, TrainBackend,
    TrainingOptions,
};

fn run(args: &TrainArgs) -> anyhow::Result<()> {
    let model_name = model_name_from_dataset_path(&args.sframe)?;
    info!("iterations: {}", args.epochs());

    // load data, divide into train and test data and start training
    let dataset = Dataset::load(&args.sframe)
        .with_context(|| format!("failed to load dataset {}", args.sframe.display()))?;
    info!("{}", dataset);

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (train_data, test_data) = dataset.random_split(args.rand_split(), &mut rng);
    info!("train: {}", train_data);
    info!("test: {}", test_data);

    let options = TrainingOptions {
        base_model: args.base_model(),
        max_iterations: args.epochs(),
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
    };
    let detector = train_detector(&train_data, dataset.classes(), &options, &mut rng)?;

    let model_dir = args.output.join(format!("{model_name}.model"));
    save_model(&detector, &model_dir)?;
    info!("Saved model to {}", model_dir.display());

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let scores = evaluate(&detector, &dataset, &device)?;
    info!("scores: {}", serde_json::to_string(&scores)?);

    if test_data.is_empty() {
        warn!("Test split is empty; skipping held-out evaluation");
    } else {
        let test_scores = evaluate(&detector, &test_data, &device)?;
        info!("test scores: {}", serde_json::to_string(&test_scores)?);
    }

    let export_path = args.export_dir.join(format!("{model_name}.mlmodel"));
    export_model(&detector, &export_path)?;
    info!("Exported model to {}", export_path.display());

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = TrainArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Training failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
