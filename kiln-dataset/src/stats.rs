use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::{layout, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSummary {
    pub min: (u32, u32),
    pub max: (u32, u32),
    pub avg: (u32, u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub label_counts: BTreeMap<String, usize>,
    pub sizes: Option<SizeSummary>,
    pub unreadable: usize,
}

impl DatasetStats {
    pub fn total(&self) -> usize {
        self.label_counts.values().sum()
    }
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Label distribution:")?;
        for (label, count) in &self.label_counts {
            writeln!(f, "  {label}: {count}")?;
        }
        match self.sizes {
            Some(SizeSummary { min, max, avg }) => write!(
                f,
                "Image size (WxH) - min: {}x{}, max: {}x{}, avg: {}x{}",
                min.0, min.1, max.0, max.1, avg.0, avg.1
            ),
            None => write!(f, "No images found."),
        }
    }
}

/// Per-label counts plus per-axis min, max and floored mean of the image sizes.
pub fn dataset_stats(input: &Path) -> Result<DatasetStats> {
    let mut stats = DatasetStats::default();
    let mut dims = Vec::new();
    for entry in layout::scan(input)? {
        match image::image_dimensions(&entry.path) {
            Ok(size) => {
                dims.push(size);
                *stats.label_counts.entry(entry.label).or_default() += 1;
            }
            Err(e) => {
                warn!("Error reading {}: {e}", entry.path.display());
                stats.unreadable += 1;
            }
        }
    }

    if let Some(&first) = dims.first() {
        let n = dims.len() as u64;
        let (mut min, mut max, mut sum) = (first, first, (0u64, 0u64));
        for &(w, h) in &dims {
            min = (min.0.min(w), min.1.min(h));
            max = (max.0.max(w), max.1.max(h));
            sum = (sum.0 + u64::from(w), sum.1 + u64::from(h));
        }
        stats.sizes = Some(SizeSummary {
            min,
            max,
            avg: ((sum.0 / n) as u32, (sum.1 / n) as u32),
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn summarises_labels_and_sizes() {
        let dir = TempDir::new().unwrap();
        for (label, name, w, h) in [
            ("greek", "a.png", 10, 40),
            ("greek", "b.png", 30, 20),
            ("raku", "c.png", 21, 30),
        ] {
            fs::create_dir_all(dir.path().join(label)).unwrap();
            image::RgbImage::new(w, h)
                .save(dir.path().join(label).join(name))
                .unwrap();
        }
        fs::write(dir.path().join("raku/broken.png"), b"junk").unwrap();

        let stats = dataset_stats(dir.path()).unwrap();

        assert_eq!(stats.total(), 3);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(
            stats.sizes,
            Some(SizeSummary {
                min: (10, 20),
                max: (30, 40),
                avg: (20, 30),
            })
        );
        assert_eq!(
            stats.to_string(),
            "Label distribution:\n  greek: 2\n  raku: 1\n\
             Image size (WxH) - min: 10x20, max: 30x40, avg: 20x30"
        );
    }

    #[test]
    fn empty_dataset_reports_no_images() {
        let dir = TempDir::new().unwrap();
        let stats = dataset_stats(dir.path()).unwrap();
        assert!(stats.to_string().ends_with("No images found."));
    }
}
