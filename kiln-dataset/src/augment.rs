use std::fs;
use std::path::Path;

use image::{DynamicImage, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::{error, info};

use crate::{layout, Result, Summary};

const ROTATIONS: [u16; 4] = [0, 90, 180, 270];
const JITTER_RANGE: std::ops::RangeInclusive<f32> = 0.8..=1.2;

/// Blends every pixel toward its luma; 0 is grayscale, 1 the original colours.
pub fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b] = pixel.0.map(f32::from);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        pixel.0 = [r, g, b].map(|c| (luma + factor * (c - luma)).round().clamp(0.0, 255.0) as u8);
    }
    out
}

pub fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel.0 = pixel
            .0
            .map(|c| (f32::from(c) * factor).round().clamp(0.0, 255.0) as u8);
    }
    out
}

/// Random mirror, quarter-turn rotation, and colour/brightness jitter.
///
/// Rotations are counter-clockwise and lossless, so 90 and 270 degrees swap width and height.
pub fn augment_image(img: &DynamicImage, rng: &mut impl Rng) -> DynamicImage {
    let mut img = img.to_rgb8();
    if rng.gen_bool(0.5) {
        img = image::imageops::flip_horizontal(&img);
    }
    img = match ROTATIONS.choose(rng).copied().unwrap_or(0) {
        90 => image::imageops::rotate270(&img),
        180 => image::imageops::rotate180(&img),
        270 => image::imageops::rotate90(&img),
        _ => img,
    };
    if rng.gen_bool(0.5) {
        img = adjust_saturation(&img, rng.gen_range(JITTER_RANGE));
    }
    if rng.gen_bool(0.5) {
        img = adjust_brightness(&img, rng.gen_range(JITTER_RANGE));
    }
    DynamicImage::ImageRgb8(img)
}

fn augment_file(
    entry: &layout::LabeledImage,
    label_dir: &Path,
    num_augments: usize,
    rng: &mut StdRng,
) -> Result<usize> {
    let img = image::open(&entry.path)?;
    fs::create_dir_all(label_dir)?;
    for i in 0..num_augments {
        let name = format!("aug_{i}_{}", entry.file_name());
        augment_image(&img, rng).save(label_dir.join(name))?;
    }
    Ok(num_augments)
}

/// Writes `num_augments` variants of every image as `<output>/<label>/aug_<i>_<name>`.
pub fn augment_dataset(
    input: &Path,
    output: &Path,
    num_augments: usize,
    seed: Option<u64>,
) -> Result<Summary> {
    let images = layout::scan(input)?;
    fs::create_dir_all(output)?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let progress = layout::progress_bar(images.len(), "augmenting");
    let mut summary = Summary::default();
    for entry in &images {
        match augment_file(entry, &output.join(&entry.label), num_augments, &mut rng) {
            Ok(written) => summary.processed += written,
            Err(e) => {
                error!("Error augmenting {}: {e}", entry.path.display());
                summary.failed += 1;
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    info!("Augmented dataset saved to {}", output.display());
    Ok(summary)
}
