use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::{Error, Result};

pub const PRIMARY_WEIGHT_NAME: &str = "pytorch_lora_weights.safetensors";

/// Checked in order when the primary file is absent.
pub const CANDIDATE_WEIGHT_NAMES: [&str; 5] = [
    "pytorch_lora_weights.safetensors",
    "pytorch_lora_weights.bin",
    "adapter_model.safetensors",
    "lora_weights.safetensors",
    "diffusion_pytorch_model.safetensors",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterReference {
    pub dir: PathBuf,
    pub weight_name: String,
}

impl AdapterReference {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.weight_name)
    }

    pub fn is_pickle(&self) -> bool {
        self.weight_name.ends_with(".bin")
    }
}

pub fn resolve_adapter(dir: impl AsRef<Path>) -> Result<AdapterReference> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::MissingDirectory(dir.to_path_buf()));
    }

    let found = std::iter::once(PRIMARY_WEIGHT_NAME)
        .chain(CANDIDATE_WEIGHT_NAMES)
        .find(|name| dir.join(name).is_file());

    match found {
        Some(name) => {
            info!("Found LoRA weights: {}", name);
            Ok(AdapterReference {
                dir: dir.to_path_buf(),
                weight_name: name.to_string(),
            })
        }
        None => {
            let mut available = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            available.sort();
            warn!(dir = %dir.display(), ?available, "no LoRA weights found");
            Err(Error::AdapterNotFound {
                dir: dir.to_path_buf(),
                available,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), b"weights").unwrap();
    }

    #[test]
    fn primary_name_wins() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "adapter_model.safetensors");
        touch(&dir, "pytorch_lora_weights.safetensors");

        let adapter = resolve_adapter(dir.path()).unwrap();

        assert_eq!(adapter.weight_name, "pytorch_lora_weights.safetensors");
        assert_eq!(adapter.path(), dir.path().join("pytorch_lora_weights.safetensors"));
    }

    #[test]
    fn falls_back_to_alternate_name() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "adapter_model.safetensors");

        let adapter = resolve_adapter(dir.path()).unwrap();

        assert_eq!(adapter.weight_name, "adapter_model.safetensors");
        assert!(!adapter.is_pickle());
    }

    #[test]
    fn respects_candidate_priority() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "diffusion_pytorch_model.safetensors");
        touch(&dir, "pytorch_lora_weights.bin");

        let adapter = resolve_adapter(dir.path()).unwrap();

        assert_eq!(adapter.weight_name, "pytorch_lora_weights.bin");
        assert!(adapter.is_pickle());
    }

    #[test]
    fn empty_directory_is_not_found() {
        let dir = TempDir::new().unwrap();

        let err = resolve_adapter(dir.path()).unwrap_err();

        assert!(matches!(err, Error::AdapterNotFound { ref available, .. } if available.is_empty()));
    }

    #[test]
    fn not_found_lists_directory_contents() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "readme.md");
        touch(&dir, "config.json");

        match resolve_adapter(dir.path()).unwrap_err() {
            Error::AdapterNotFound { available, .. } => {
                assert_eq!(available, vec!["config.json", "readme.md"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        assert!(matches!(
            resolve_adapter(&missing).unwrap_err(),
            Error::MissingDirectory(path) if path == missing
        ));
    }
}
