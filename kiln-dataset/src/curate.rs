use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::FilterType;
use rayon::prelude::*;
use tracing::{error, info};

use crate::{layout, DatasetError, Result, Summary};

pub const LABELS_FILE: &str = "labels.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
        }
    }
}

impl FromStr for ImageSize {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DatasetError::InvalidArgument(format!("expected WIDTHxHEIGHT, got {s:?}"));
        let (w, h) = s.split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct CurateOptions {
    pub size: ImageSize,
    pub workers: usize,
    pub export_labels: bool,
}

impl Default for CurateOptions {
    fn default() -> Self {
        Self {
            size: ImageSize::default(),
            workers: 8,
            export_labels: true,
        }
    }
}

fn process_image(src: &Path, dst: &Path, size: ImageSize) -> Result<()> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }
    let img = image::open(src)?.to_rgb8();
    let resized = image::imageops::resize(&img, size.width, size.height, FilterType::CatmullRom);
    resized.save(dst)?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// `image_path,label` rows, sorted by path.
pub fn write_labels(path: &Path, rows: &[(PathBuf, String)]) -> Result<()> {
    let mut rows = rows.to_vec();
    rows.sort();
    let mut out = String::from("image_path,label\n");
    for (image_path, label) in &rows {
        out.push_str(&csv_field(&image_path.to_string_lossy()));
        out.push(',');
        out.push_str(&csv_field(label));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Converts every image to RGB at a fixed size on a worker pool, mirroring the label layout.
pub fn curate_dataset(source: &Path, output: &Path, options: &CurateOptions) -> Result<Summary> {
    let images = layout::scan(source)?;
    fs::create_dir_all(output)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .build()?;

    let progress = layout::progress_bar(images.len(), "curating");
    let results: Vec<Option<(PathBuf, String)>> = pool.install(|| {
        images
            .par_iter()
            .map(|entry| {
                let dst = output.join(&entry.label).join(entry.file_name());
                let result = process_image(&entry.path, &dst, options.size);
                progress.inc(1);
                match result {
                    Ok(()) => Some((dst, entry.label.clone())),
                    Err(e) => {
                        error!("Error processing {}: {e}", entry.path.display());
                        None
                    }
                }
            })
            .collect()
    });
    progress.finish_and_clear();

    let failed = results.iter().filter(|r| r.is_none()).count();
    let labels: Vec<_> = results.into_iter().flatten().collect();
    if options.export_labels && !labels.is_empty() {
        let csv_path = output.join(LABELS_FILE);
        write_labels(&csv_path, &labels)?;
        info!("Exported labels to {}", csv_path.display());
    }
    info!(
        "Curated dataset at {} with {} images.",
        output.display(),
        labels.len()
    );
    Ok(Summary {
        processed: labels.len(),
        failed,
    })
}
