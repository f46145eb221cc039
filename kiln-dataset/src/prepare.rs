use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::{layout, Result, Summary};

/// Flattens `<input>/<label>/<name>` into `<output>/<label>_<name>` for diffusers training.
pub fn prepare_for_diffusers(input: &Path, output: &Path) -> Result<Summary> {
    let images = layout::scan(input)?;
    fs::create_dir_all(output)?;
    let mut summary = Summary::default();
    for entry in images {
        let target = output.join(format!("{}_{}", entry.label, entry.file_name()));
        match fs::copy(&entry.path, &target) {
            Ok(_) => summary.processed += 1,
            Err(e) => {
                warn!("Error copying {}: {e}", entry.path.display());
                summary.failed += 1;
            }
        }
    }
    info!("Prepared dataset for diffusers at {}", output.display());
    Ok(summary)
}
