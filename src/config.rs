use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Command-line arguments for converting a Labelbox JSON export to a dataset.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Convert a Labelbox JSON export into a detection dataset", long_about = None)]
pub struct ConvertArgs {
    /// Path to the Labelbox JSON export
    #[arg(short = 'j', long = "json_input_file")]
    pub json_input_file: PathBuf,

    /// Path of the dataset directory to create
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Directory containing the labeled images
    #[arg(short = 'i', long = "images_dir")]
    pub images_dir: PathBuf,
}

/// Command-line arguments for training an object detector on a dataset.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Train, evaluate and export an object detector", long_about = None)]
pub struct TrainArgs {
    /// Path to the dataset directory written by labelbox2dataset
    #[arg(short = 's', long = "sframe")]
    pub sframe: PathBuf,

    /// Directory to write the saved model into
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Maximum number of training iterations; 0 picks one from the dataset size
    #[arg(short = 'e', long = "epochs")]
    pub epochs: Option<usize>,

    /// Fraction of rows used for training, the rest is held out for testing
    #[arg(short = 'r', long = "rand_split", value_parser = validate_fraction)]
    pub rand_split: Option<f64>,

    /// Base model architecture
    #[arg(short = 'm', long = "base_model", value_enum)]
    pub base_model: Option<BaseModel>,

    /// Rows per training batch
    #[arg(long = "batch_size", default_value_t = 8, value_parser = validate_positive)]
    pub batch_size: usize,

    /// Optimizer learning rate
    #[arg(long = "learning_rate", default_value_t = 1e-3)]
    pub learning_rate: f64,

    /// Seed for the random split and batch shuffling
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Directory to write the deployment export into
    #[arg(long = "export_dir", default_value = ".")]
    pub export_dir: PathBuf,
}

impl TrainArgs {
    pub const DEFAULT_RAND_SPLIT: f64 = 0.8;

    pub fn epochs(&self) -> usize {
        self.epochs.unwrap_or(0)
    }

    pub fn rand_split(&self) -> f64 {
        self.rand_split.unwrap_or(Self::DEFAULT_RAND_SPLIT)
    }

    pub fn base_model(&self) -> BaseModel {
        self.base_model.unwrap_or_default()
    }
}

/// Command-line arguments for running an exported detector on images.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Detect objects in images with an exported model", long_about = None)]
pub struct DetectArgs {
    /// Path to the exported .mlmodel bundle
    #[arg(short = 'm', long = "model")]
    pub model: PathBuf,

    /// Minimum confidence for a prediction to be reported
    #[arg(long = "confidence_threshold", default_value_t = 0.6, value_parser = validate_fraction)]
    pub confidence_threshold: f64,

    /// Maximum number of predictions reported per image
    #[arg(long = "max_predictions", default_value_t = 10, value_parser = validate_positive)]
    pub max_predictions: usize,

    /// Images to run detection on
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
}

// Detector architectures that can be trained from scratch
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum BaseModel {
    /// Darknet-style backbone at 416x416 input with a 13x13 grid
    #[default]
    DarknetYolo,
    /// Narrower backbone at 208x208 input with a 13x13 grid, for small datasets
    TinyYolo,
}

impl std::fmt::Display for BaseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseModel::DarknetYolo => f.write_str("darknet-yolo"),
            BaseModel::TinyYolo => f.write_str("tiny-yolo"),
        }
    }
}

// Validate that the value is between 0.0 and 1.0
pub fn validate_fraction(s: &str) -> Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("value must be between 0.0 and 1.0".to_string()),
    }
}

pub fn validate_positive(s: &str) -> Result<usize, String> {
    match usize::from_str(s) {
        Ok(val) if val > 0 => Ok(val),
        _ => Err("value must be a positive integer".to_string()),
    }
}
