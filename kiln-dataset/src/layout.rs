//! `<root>/<label>/<image>` directory layout shared by every command.

use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::{DatasetError, Result};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LabeledImage {
    pub label: String,
    pub path: PathBuf,
}

impl LabeledImage {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn require_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(DatasetError::MissingDirectory(path.to_path_buf()))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Every image one level below a label directory, ordered by label then file name.
pub fn scan(root: &Path) -> Result<Vec<LabeledImage>> {
    require_dir(root)?;
    let mut images = Vec::new();
    for label_dir in sorted_entries(root)? {
        if !label_dir.is_dir() {
            continue;
        }
        let label = label_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for path in sorted_entries(&label_dir)? {
            if path.is_file() && is_image(&path) {
                images.push(LabeledImage {
                    label: label.clone(),
                    path,
                });
            }
        }
    }
    Ok(images)
}

pub(crate) fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("vase.png", true)]
    #[case("vase.JPG", true)]
    #[case("vase.jpeg", true)]
    #[case("notes.txt", false)]
    #[case("no_extension", false)]
    fn recognises_image_extensions(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_image(Path::new(name)), expected);
    }

    #[test]
    fn scan_orders_by_label_and_skips_loose_files() {
        let dir = TempDir::new().unwrap();
        for (label, name) in [("roman", "b.png"), ("greek", "z.jpg"), ("greek", "a.png")] {
            fs::create_dir_all(dir.path().join(label)).unwrap();
            fs::write(dir.path().join(label).join(name), b"").unwrap();
        }
        fs::write(dir.path().join("loose.png"), b"").unwrap();
        fs::write(dir.path().join("greek/readme.md"), b"").unwrap();

        let images = scan(dir.path()).unwrap();

        let found: Vec<_> = images
            .iter()
            .map(|img| (img.label.as_str(), img.file_name()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("greek", "a.png".to_string()),
                ("greek", "z.jpg".to_string()),
                ("roman", "b.png".to_string())
            ]
        );
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            scan(&dir.path().join("absent")),
            Err(DatasetError::MissingDirectory(_))
        ));
    }
}
