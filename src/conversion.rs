use indicatif::ProgressBar;
use log::debug;
use rayon::prelude::*;
use std::path::Path;

use crate::errors::{ConversionError, ConversionResult};
use crate::types::{
    Annotation, BoundingBox, Coordinates, DatasetRow, ImageSize, LabelValue, LabelboxRecord, Point,
    ProcessingStats,
};
use crate::utils::{image_filename_from_record, read_image_size};

/// Convert a Labelbox box into a center/extent rectangle with the y axis inverted.
///
/// Labelbox lists the corners starting at the top-left and going down the left edge,
/// so corners 0 and 2 are diagonal and corners 0 and 1 share an x. Corner order is
/// not checked; a box drawn in another order converts to the wrong rectangle. Returns
/// `None` when fewer than four corners are present.
pub fn coordinates_from_bounding_box(
    bounding_box: &[Point],
    image_size: ImageSize,
) -> Option<Coordinates> {
    if bounding_box.len() < 4 {
        return None;
    }
    let (p0, p1, p2) = (bounding_box[0], bounding_box[1], bounding_box[2]);

    let x = (p0.x + p2.x) / 2.0;
    let y = (p0.y + p1.y) / 2.0;
    let width = (p2.x - p0.x).abs();
    let height = (p0.y - p1.y).abs();

    // invert y
    let y = image_size.height as f64 - y;

    Some(Coordinates {
        x,
        y,
        width,
        height,
    })
}

/// Flatten every class bucket of a label into one list of rectangle annotations
pub fn annotations_from_classes(
    classes: &[(String, Vec<BoundingBox>)],
    image_size: ImageSize,
) -> ConversionResult<Vec<Annotation>> {
    let mut annotations = Vec::with_capacity(classes.iter().map(|(_, b)| b.len()).sum());

    for (class_name, bounding_boxes) in classes {
        for bounding_box in bounding_boxes {
            let coordinates = coordinates_from_bounding_box(bounding_box, image_size).ok_or_else(
                || ConversionError::MalformedBoundingBox {
                    label: class_name.clone(),
                    points: bounding_box.len(),
                },
            )?;
            debug!("{} box {:?} -> {:?}", class_name, bounding_box, coordinates);
            annotations.push(Annotation::rectangle(coordinates, class_name));
        }
    }

    Ok(annotations)
}

/// Build the dataset row for one Labelbox record.
///
/// The image must exist under `images_dir`; its true pixel size drives the y inversion.
pub fn row_from_record(record: &LabelboxRecord, images_dir: &Path) -> ConversionResult<DatasetRow> {
    let image = image_filename_from_record(record).ok_or(ConversionError::UnresolvableImage)?;
    let image_size = read_image_size(&images_dir.join(&image))?;

    let annotations = match &record.label {
        label if label.is_skip() => None,
        LabelValue::Classes(classes) => Some(annotations_from_classes(classes, image_size)?),
        LabelValue::Sentinel(value) => {
            return Err(ConversionError::UnexpectedLabel {
                image,
                value: value.clone(),
            })
        }
    };

    Ok(DatasetRow {
        image,
        width: image_size.width,
        height: image_size.height,
        annotations,
    })
}

/// Build rows for every record in parallel, keeping export order.
///
/// Stops at the first record that fails to convert.
pub fn rows_from_records(
    records: &[LabelboxRecord],
    images_dir: &Path,
    stats: &ProcessingStats,
    pb: &ProgressBar,
) -> ConversionResult<Vec<DatasetRow>> {
    records
        .par_iter()
        .map(|record| {
            let row = row_from_record(record, images_dir)?;
            stats.record(&row);
            pb.inc(1);
            Ok(row)
        })
        .collect()
}
