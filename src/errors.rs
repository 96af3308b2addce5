//! Error definitions for the Labelbox conversion pipeline.

use std::path::PathBuf;
use thiserror::Error;

pub type ConversionResult<T> = Result<T, ConversionError>;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("record has neither an External ID nor a Labeled Data URL naming its image")]
    UnresolvableImage,
    #[error("bounding box for label {label:?} has {points} points, expected 4")]
    MalformedBoundingBox { label: String, points: usize },
    #[error("unexpected label value {value:?} for image {image}")]
    UnexpectedLabel { image: String, value: String },
}

impl ConversionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConversionError::Io {
            path: path.into(),
            source,
        }
    }
}
