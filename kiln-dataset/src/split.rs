use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{info, warn};

use crate::{layout, DatasetError, Result, Summary};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.15,
            test: 0.15,
        }
    }
}

impl SplitRatios {
    pub fn validate(&self) -> Result<()> {
        for (name, ratio) in [("train", self.train), ("val", self.val), ("test", self.test)] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(DatasetError::InvalidArgument(format!(
                    "{name} ratio must be within [0, 1], got {ratio}"
                )));
            }
        }
        let sum = self.train + self.val + self.test;
        if (sum - 1.0).abs() > 1e-6 {
            warn!("split ratios sum to {sum}; the remainder goes to test");
        }
        Ok(())
    }

    /// `(train, val, test)` counts; test takes whatever the floored train and val leave.
    pub fn counts(&self, n: usize) -> (usize, usize, usize) {
        let train = ((n as f64 * self.train).floor() as usize).min(n);
        let val = ((n as f64 * self.val).floor() as usize).min(n - train);
        (train, val, n - train - val)
    }
}

/// Assignment of every file to `train`, `val` or `test`, shuffled per label.
pub fn plan(
    images: Vec<layout::LabeledImage>,
    ratios: &SplitRatios,
    seed: u64,
) -> BTreeMap<&'static str, Vec<layout::LabeledImage>> {
    let mut by_label: BTreeMap<String, Vec<layout::LabeledImage>> = BTreeMap::new();
    for image in images {
        by_label.entry(image.label.clone()).or_default().push(image);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut plan: BTreeMap<&'static str, Vec<layout::LabeledImage>> = BTreeMap::new();
    for (_, mut group) in by_label {
        group.shuffle(&mut rng);
        let (train, val, _) = ratios.counts(group.len());
        let test = group.split_off(train + val);
        let val_part = group.split_off(train);
        plan.entry("train").or_default().extend(group);
        plan.entry("val").or_default().extend(val_part);
        plan.entry("test").or_default().extend(test);
    }
    plan
}

/// Copies `<input>/<label>/<name>` to `<output>/<split>/<label>/<name>`.
pub fn split_dataset(input: &Path, output: &Path, ratios: &SplitRatios, seed: u64) -> Result<Summary> {
    ratios.validate()?;
    let images = layout::scan(input)?;
    fs::create_dir_all(output)?;

    let mut summary = Summary::default();
    for (split, images) in plan(images, ratios, seed) {
        for image in images {
            let dir: PathBuf = output.join(split).join(&image.label);
            let copied = fs::create_dir_all(&dir)
                .and_then(|_| fs::copy(&image.path, dir.join(image.file_name())));
            match copied {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    warn!("Error copying {}: {e}", image.path.display());
                    summary.failed += 1;
                }
            }
        }
        fs::create_dir_all(output.join(split))?;
    }
    info!("Dataset split into train/val/test in {}", output.display());
    Ok(summary)
}
