use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::errors::{ConversionError, ConversionResult};
use crate::types::DatasetRow;

/// File name of the manifest inside a dataset directory
pub const MANIFEST_FILE: &str = "dataset.json";
/// Subdirectory holding the copied images
pub const IMAGES_DIR: &str = "images";
pub const DATASET_FORMAT_VERSION: u32 = 1;

// On-disk layout of dataset.json
#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub format_version: u32,
    pub date_created: String,
    pub feature: String,
    pub annotations: String,
    pub rows: Vec<DatasetRow>,
}

impl DatasetManifest {
    pub fn new(rows: Vec<DatasetRow>) -> Self {
        Self {
            format_version: DATASET_FORMAT_VERSION,
            date_created: Utc::now().to_rfc3339(),
            feature: "image".to_string(),
            annotations: "annotations".to_string(),
            rows,
        }
    }
}

/// An ordered collection of dataset rows rooted at a dataset directory
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
    rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>, rows: Vec<DatasetRow>) -> Self {
        Self {
            root: root.into(),
            rows,
        }
    }

    /// Load a dataset from its directory, or from the manifest file directly
    pub fn load(path: &Path) -> ConversionResult<Self> {
        let (root, manifest_path) = if path.is_file() {
            let root = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            (root, path.to_path_buf())
        } else {
            (path.to_path_buf(), path.join(MANIFEST_FILE))
        };

        let file = File::open(&manifest_path)
            .map_err(|source| ConversionError::io(&manifest_path, source))?;
        let manifest: DatasetManifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ConversionError::Json {
                path: manifest_path.clone(),
                source,
            })?;

        if manifest.format_version != DATASET_FORMAT_VERSION {
            log::warn!(
                "Dataset {} has format version {}, expected {}",
                manifest_path.display(),
                manifest.format_version,
                DATASET_FORMAT_VERSION
            );
        }

        Ok(Self::new(root, manifest.rows))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Absolute location of a row's image on disk
    pub fn image_path(&self, row: &DatasetRow) -> PathBuf {
        self.root.join(IMAGES_DIR).join(&row.image)
    }

    /// Sorted set of every label used by an annotation in this dataset
    pub fn classes(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.annotations.as_ref())
            .flatten()
            .map(|annotation| annotation.label.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn annotation_count(&self) -> usize {
        self.rows.iter().map(DatasetRow::annotation_count).sum()
    }

    /// Randomly split into (train, test).
    ///
    /// Each row independently lands in the train half with probability `fraction`,
    /// so the train size is only approximately `fraction * len`. Row order is kept
    /// within each half.
    pub fn random_split<R: Rng>(&self, fraction: f64, rng: &mut R) -> (Dataset, Dataset) {
        let fraction = fraction.clamp(0.0, 1.0);
        let (train, test): (Vec<_>, Vec<_>) = self
            .rows
            .iter()
            .cloned()
            .partition(|_| rng.gen_bool(fraction));

        (
            Dataset::new(self.root.clone(), train),
            Dataset::new(self.root.clone(), test),
        )
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dataset({}, rows: {}, annotations: {}, classes: {:?})",
            self.root.display(),
            self.rows.len(),
            self.annotation_count(),
            self.classes()
        )
    }
}
