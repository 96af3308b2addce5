//! Labelbox to object-detection dataset converter and detector trainer
//!
//! This library converts Labelbox JSON exports into an on-disk detection dataset and
//! trains, evaluates and exports a grid-based object detector on that dataset.

#![recursion_limit = "256"]

pub mod config;
pub mod conversion;
pub mod dataset;
pub mod detector;
pub mod errors;
pub mod evaluation;
pub mod export;
pub mod io;
pub mod labelbox_json;
pub mod model;
pub mod training;
pub mod types;
pub mod utils;

// Re-export commonly used types and functions
pub use config::{BaseModel, ConvertArgs, DetectArgs, TrainArgs};
pub use conversion::{coordinates_from_bounding_box, row_from_record, rows_from_records};
pub use dataset::Dataset;
pub use detector::{Prediction, TrainedDetector};
pub use errors::{ConversionError, ConversionResult};
pub use evaluation::{evaluate, EvaluationScores};
pub use export::{export_model, load_export, load_model, save_model};
pub use io::{read_labelbox_export_file, write_dataset};
pub use training::{train_detector, TrainBackend, TrainingOptions};
pub use types::{Annotation, Coordinates, DatasetRow, ImageSize, LabelValue, LabelboxRecord, Point};
pub use utils::image_filename_from_record;
