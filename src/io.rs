use indicatif::ProgressBar;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::dataset::{Dataset, DatasetManifest, IMAGES_DIR, MANIFEST_FILE};
use crate::errors::{ConversionError, ConversionResult};
use crate::labelbox_json::read_labelbox_export;
use crate::types::{DatasetRow, LabelboxRecord};
use crate::utils::create_output_directory;

/// Read and parse a Labelbox JSON export file
pub fn read_labelbox_export_file(path: &Path) -> ConversionResult<Vec<LabelboxRecord>> {
    let file = File::open(path).map_err(|source| ConversionError::io(path, source))?;
    read_labelbox_export(BufReader::new(file)).map_err(|source| ConversionError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Set up the directory structure for dataset output, returning the images directory
pub fn setup_dataset_directories(output_dir: &Path) -> ConversionResult<std::path::PathBuf> {
    fs::create_dir_all(output_dir).map_err(|source| ConversionError::io(output_dir, source))?;
    let images_dir = output_dir.join(IMAGES_DIR);
    create_output_directory(&images_dir).map_err(|source| ConversionError::io(&images_dir, source))
}

/// Map every distinct source image name to its file name inside the dataset.
///
/// Names are sanitized; a sanitized name already taken by another source (compared
/// case-insensitively) gets a numeric suffix before its extension. Assignment follows
/// row order, so the mapping is deterministic.
pub fn assign_dataset_filenames(rows: &[DatasetRow]) -> HashMap<String, String> {
    let mut assigned: HashMap<String, String> = HashMap::new();
    let mut used: HashSet<String> = HashSet::new();

    for row in rows {
        if assigned.contains_key(&row.image) {
            continue;
        }
        let sanitized = sanitize_filename::sanitize(&row.image);
        let mut candidate = sanitized.clone();
        let mut suffix = 1;
        while used.contains(&candidate.to_lowercase()) {
            candidate = suffixed_filename(&sanitized, suffix);
            suffix += 1;
        }
        used.insert(candidate.to_lowercase());
        assigned.insert(row.image.clone(), candidate);
    }

    assigned
}

fn suffixed_filename(name: &str, suffix: usize) -> String {
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|stem| stem.to_str()),
        path.extension().and_then(|ext| ext.to_str()),
    ) {
        (Some(stem), Some(ext)) => format!("{}_{}.{}", stem, suffix, ext),
        _ => format!("{}_{}", name, suffix),
    }
}

/// Copy every row's image into the dataset and write the manifest.
///
/// Each distinct source image is copied once under the name chosen by
/// [`assign_dataset_filenames`]; the returned dataset refers to the copies.
pub fn write_dataset(
    rows: Vec<DatasetRow>,
    source_images_dir: &Path,
    output_dir: &Path,
    pb: &ProgressBar,
) -> ConversionResult<Dataset> {
    // Recreating the images directory must never wipe the source images
    let target = output_dir.join(IMAGES_DIR);
    if let (Ok(a), Ok(b)) = (fs::canonicalize(&target), fs::canonicalize(source_images_dir)) {
        if a == b {
            return Err(ConversionError::io(
                target,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "dataset images directory is the source images directory",
                ),
            ));
        }
    }

    let images_dir = setup_dataset_directories(output_dir)?;

    let filenames = assign_dataset_filenames(&rows);
    pb.set_length(filenames.len() as u64);
    filenames
        .par_iter()
        .map(|(image, filename)| {
            let source = source_images_dir.join(image);
            fs::copy(&source, images_dir.join(filename))
                .map_err(|e| ConversionError::io(&source, e))?;
            pb.inc(1);
            Ok(())
        })
        .collect::<ConversionResult<()>>()?;

    let rows: Vec<DatasetRow> = rows
        .into_iter()
        .map(|mut row| {
            if let Some(filename) = filenames.get(&row.image) {
                row.image = filename.clone();
            }
            row
        })
        .collect();

    let manifest_path = output_dir.join(MANIFEST_FILE);
    let manifest = DatasetManifest::new(rows);
    let mut writer = BufWriter::new(
        File::create(&manifest_path).map_err(|source| ConversionError::io(&manifest_path, source))?,
    );
    serde_json::to_writer_pretty(&mut writer, &manifest).map_err(|source| {
        ConversionError::Json {
            path: manifest_path.clone(),
            source,
        }
    })?;
    writer
        .flush()
        .map_err(|source| ConversionError::io(&manifest_path, source))?;

    Ok(Dataset::new(output_dir, manifest.rows))
}
