use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::Path;

use crate::errors::{ConversionError, ConversionResult};
use crate::types::{ImageSize, LabelboxRecord};

/// Resolve the image filename a Labelbox record refers to.
///
/// A non-empty External ID wins; otherwise the last path segment of the Labeled Data URL.
pub fn image_filename_from_record(record: &LabelboxRecord) -> Option<String> {
    match record.external_id.as_deref() {
        Some(external_id) if !external_id.is_empty() => Some(external_id.to_string()),
        _ => record.labeled_data.as_deref().and_then(filename_from_url),
    }
}

/// Last path segment of a URL, ignoring any query string or fragment
pub fn filename_from_url(url: &str) -> Option<String> {
    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let end = without_scheme
        .find(|c: char| c == '?' || c == '#')
        .unwrap_or(without_scheme.len());
    let without_query = &without_scheme[..end];

    // The first segment of an absolute URL is the host, never a filename
    let path = match (url.contains("://"), without_query.find('/')) {
        (true, Some(idx)) => &without_query[idx..],
        (true, None) => "",
        (false, _) => without_query,
    };

    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Read the pixel size of an image file from its header
pub fn read_image_size(path: &Path) -> ConversionResult<ImageSize> {
    let (width, height) = image::image_dimensions(path).map_err(|source| ConversionError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ImageSize { width, height })
}

/// Create a progress bar with the given length and label
pub fn create_progress_bar(len: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{}] [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})",
                label
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Safely create an output directory, replacing any previous one
pub fn create_output_directory(path: &Path) -> std::io::Result<std::path::PathBuf> {
    if path.exists() {
        log::warn!(
            "Directory {:?} already exists. Deleting and recreating it.",
            path
        );
        fs::remove_dir_all(path).and_then(|_| fs::create_dir_all(path))?;
    } else {
        fs::create_dir_all(path)?;
    }
    Ok(path.to_path_buf())
}
