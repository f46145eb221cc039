use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use tracing::info;

use crate::{GenerationRequest, NormalizedPrompt, Result};

/// One generated image together with everything needed to reproduce it.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub image: DynamicImage,
    pub request: GenerationRequest,
    /// The prompt the model actually saw, after composition and translation.
    pub final_prompt: String,
    pub seed: u64,
    pub normalization: NormalizedPrompt,
}

impl GeneratedArtifact {
    pub fn png_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    pub fn to_base64(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(self.png_bytes()?))
    }

    pub fn data_url(&self) -> Result<String> {
        Ok(format!("data:image/png;base64,{}", self.to_base64()?))
    }

    /// Writes the image as PNG, creating missing parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.image.save_with_format(path, ImageFormat::Png)?;
        info!("Image saved to: {}", path.display());
        Ok(())
    }
}
