//! Pulls a labelled image dataset from the Hugging Face datasets-server.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{layout, DatasetError, Result, Summary};

pub const DATASETS_SERVER_URL: &str = "https://datasets-server.huggingface.co";
pub const DEFAULT_DATASET: &str = "yassamina/pottery_dataset";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row_idx: usize,
    row: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ImageCell {
    src: String,
}

/// Label of a row as a single directory name: class ids verbatim, strings with path
/// separators replaced, anything else `unknown`.
fn row_label(row: &serde_json::Map<String, Value>) -> String {
    let label: String = match row.get("label") {
        Some(Value::String(label)) => label
            .trim()
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') || c.is_control() { '_' } else { c })
            .collect(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };
    if label.is_empty() || label.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        label
    }
}

fn row_image_url(row: &serde_json::Map<String, Value>) -> Option<String> {
    row.get("image")
        .cloned()
        .and_then(|cell| serde_json::from_value::<ImageCell>(cell).ok())
        .map(|cell| cell.src)
}

pub struct Downloader {
    client: reqwest::Client,
    base_url: String,
}

impl Downloader {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn page(&self, dataset: &str, split: &str, offset: usize, length: usize) -> Result<RowsPage> {
        let response = self
            .client
            .get(format!("{}/rows", self.base_url))
            .query(&[
                ("dataset", dataset),
                ("config", "default"),
                ("split", split),
                ("offset", offset.to_string().as_str()),
                ("length", length.to_string().as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DatasetError::Download(format!("{status}: {body}")));
        }
        Ok(response.json().await?)
    }

    async fn save_image(&self, url: &str, path: &Path) -> Result<()> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let img = image::load_from_memory(&bytes)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        img.to_rgb8().save(path)?;
        Ok(())
    }

    /// Stores every row's image as `<output>/<label>/pottery_<row index>.png`.
    pub async fn download(
        &self,
        dataset: &str,
        split: &str,
        output: &Path,
        limit: Option<usize>,
    ) -> Result<Summary> {
        tokio::fs::create_dir_all(output).await?;
        let mut summary = Summary::default();
        let mut offset = 0;
        let mut progress = None;
        loop {
            let remaining = limit.map_or(usize::MAX, |limit| limit.saturating_sub(offset));
            if remaining == 0 {
                break;
            }
            let page = self
                .page(dataset, split, offset, remaining.min(PAGE_SIZE))
                .await?;
            debug!(offset, rows = page.rows.len(), "fetched rows page");
            if page.rows.is_empty() {
                break;
            }
            let bar = progress.get_or_insert_with(|| {
                let total = page.num_rows_total.unwrap_or(0);
                let total = limit.map_or(total, |limit| limit.min(total));
                layout::progress_bar(total, "downloading")
            });

            offset += page.rows.len();
            for entry in page.rows {
                let path: PathBuf = output
                    .join(row_label(&entry.row))
                    .join(format!("pottery_{}.png", entry.row_idx));
                let result = match row_image_url(&entry.row) {
                    Some(url) => self.save_image(&url, &path).await,
                    None => Err(DatasetError::Download(format!(
                        "row {} has no image",
                        entry.row_idx
                    ))),
                };
                match result {
                    Ok(()) => summary.processed += 1,
                    Err(e) => {
                        error!("Error downloading row {}: {e}", entry.row_idx);
                        summary.failed += 1;
                    }
                }
                bar.inc(1);
            }
            if page.num_rows_total.is_some_and(|total| offset >= total) {
                break;
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        info!(
            "Downloaded {} images to {}",
            summary.processed,
            output.display()
        );
        Ok(summary)
    }
}
