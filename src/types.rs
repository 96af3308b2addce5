use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

/// Label value Labelbox writes for images the annotator chose to skip
pub const SKIP_SENTINEL: &str = "Skip";

/// Geometry type written for every annotation in the dataset
pub const RECTANGLE_TYPE: &str = "rectangle";

// A single corner point in Labelbox pixel coordinates (top-left origin)
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// Labelbox draws a rectangle as a polygon of four corners
pub type BoundingBox = Vec<Point>;

/// The `Label` field of a Labelbox record.
///
/// Class buckets keep the order in which they appear in the export file.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    /// A bare string; `"Skip"` marks a skipped image
    Sentinel(String),
    /// Class name to the list of boxes drawn for that class
    Classes(Vec<(String, Vec<BoundingBox>)>),
}

impl LabelValue {
    pub fn is_skip(&self) -> bool {
        matches!(self, LabelValue::Sentinel(value) if value == SKIP_SENTINEL)
    }
}

// One entry of the Labelbox JSON export
#[derive(Debug, Deserialize, Clone)]
pub struct LabelboxRecord {
    #[serde(rename = "External ID", default)]
    pub external_id: Option<String>,
    #[serde(rename = "Labeled Data", default)]
    pub labeled_data: Option<String>,
    #[serde(rename = "Label", deserialize_with = "crate::labelbox_json::deserialize_label")]
    pub label: LabelValue,
}

// Pixel dimensions read from the image file itself
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

// Rectangle center and extent in pixels, y measured from the bottom edge
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

// A normalized rectangle annotation as stored in the dataset
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Annotation {
    pub coordinates: Coordinates,
    pub label: String,
    #[serde(rename = "type")]
    pub shape_type: String,
}

impl Annotation {
    pub fn rectangle(coordinates: Coordinates, label: &str) -> Self {
        Self {
            coordinates,
            label: label.to_string(),
            shape_type: RECTANGLE_TYPE.to_string(),
        }
    }

    /// Box as `[x_min, y_min, x_max, y_max]` normalized to 0..1 with a top-left origin,
    /// which is the layout the detector trains and predicts in.
    pub fn to_normalized_xyxy(&self, size: ImageSize) -> [f32; 4] {
        let w = size.width.max(1) as f64;
        let h = size.height.max(1) as f64;
        let c = &self.coordinates;
        let center_y_from_top = h - c.y;
        [
            ((c.x - c.width / 2.0) / w) as f32,
            ((center_y_from_top - c.height / 2.0) / h) as f32,
            ((c.x + c.width / 2.0) / w) as f32,
            ((center_y_from_top + c.height / 2.0) / h) as f32,
        ]
    }
}

// One image and its annotations; `annotations` is None for skipped images
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DatasetRow {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub annotations: Option<Vec<Annotation>>,
}

impl DatasetRow {
    pub fn size(&self) -> ImageSize {
        ImageSize {
            width: self.width,
            height: self.height,
        }
    }

    pub fn annotation_count(&self) -> usize {
        self.annotations.as_ref().map_or(0, Vec::len)
    }
}

// Struct to hold conversion statistics, shared across worker threads
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub total_records: AtomicUsize,
    pub skipped_records: AtomicUsize,
    pub total_annotations: AtomicUsize,
    pub label_counts: DashMap<String, usize>,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, row: &DatasetRow) {
        self.total_records.fetch_add(1, Relaxed);
        match &row.annotations {
            None => {
                self.skipped_records.fetch_add(1, Relaxed);
            }
            Some(annotations) => {
                self.total_annotations.fetch_add(annotations.len(), Relaxed);
                for annotation in annotations {
                    *self
                        .label_counts
                        .entry(annotation.label.clone())
                        .or_insert(0) += 1;
                }
            }
        }
    }

    pub fn print_summary(&self) {
        let total = self.total_records.load(Relaxed);
        let skipped = self.skipped_records.load(Relaxed);

        log::info!("=== Conversion Summary ===");
        log::info!("Total records: {}", total);
        log::info!("Skipped records: {}", skipped);
        log::info!(
            "Total annotations: {}",
            self.total_annotations.load(Relaxed)
        );

        let mut labels: Vec<_> = self
            .label_counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        labels.sort();
        for (label, count) in labels {
            log::info!("    {}: {}", label, count);
        }

        if total > 0 && skipped == total {
            log::warn!("Every record in the export was skipped; the dataset has no annotations");
        }
    }
}
