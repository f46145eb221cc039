use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use image::{imageops, Rgb, RgbImage};
use tracing::{info, warn};

use crate::{layout, Result};

pub const GRID_COLUMNS: u32 = 4;
pub const THUMBNAIL_SIZE: u32 = 128;
const PADDING: u32 = 4;
const BAR_WIDTH: usize = 40;

/// Thumbnails of the first `count` images, four per row, each centred on a white tile.
pub fn contact_sheet(images: &[layout::LabeledImage], count: usize) -> RgbImage {
    let shown = images.len().min(count) as u32;
    let rows = shown.div_ceil(GRID_COLUMNS).max(1);
    let tile = THUMBNAIL_SIZE + 2 * PADDING;
    let mut sheet = RgbImage::from_pixel(GRID_COLUMNS * tile, rows * tile, Rgb([255, 255, 255]));

    for (i, entry) in images.iter().take(shown as usize).enumerate() {
        let thumb = match image::open(&entry.path) {
            Ok(img) => img.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE).to_rgb8(),
            Err(e) => {
                warn!("Error reading {}: {e}", entry.path.display());
                continue;
            }
        };
        let (col, row) = (i as u32 % GRID_COLUMNS, i as u32 / GRID_COLUMNS);
        let x = col * tile + PADDING + (THUMBNAIL_SIZE - thumb.width()) / 2;
        let y = row * tile + PADDING + (THUMBNAIL_SIZE - thumb.height()) / 2;
        imageops::overlay(&mut sheet, &thumb, i64::from(x), i64::from(y));
    }
    sheet
}

pub fn label_distribution(images: &[layout::LabeledImage]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in images {
        *counts.entry(entry.label.clone()).or_default() += 1;
    }
    counts
}

/// Horizontal `#` bars scaled so the most common label fills the full width.
pub fn bar_chart(counts: &BTreeMap<String, usize>) -> String {
    let widest_label = counts.keys().map(String::len).max().unwrap_or(0);
    let largest = counts.values().copied().max().unwrap_or(0).max(1);
    let mut chart = String::from("Label Distribution\n");
    for (label, &count) in counts {
        let bar = "#".repeat((count * BAR_WIDTH).div_ceil(largest));
        let _ = writeln!(chart, "{label:>widest_label$} | {bar} {count}");
    }
    chart
}

pub fn visualize_dataset(input: &Path, output: &Path, count: usize) -> Result<RgbImage> {
    let images = layout::scan(input)?;
    let counts = label_distribution(&images);
    println!(
        "Found {} images across {} labels.",
        images.len(),
        counts.len()
    );
    print!("{}", bar_chart(&counts));

    let sheet = contact_sheet(&images, count);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    sheet.save(output)?;
    info!("Saved contact sheet to {}", output.display());
    Ok(sheet)
}
