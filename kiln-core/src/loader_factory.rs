use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::info;

use crate::{
    config::PipelineConfig, Error, ImageModel, Loader, Result, StableDiffusionLoader,
    StableDiffusionVersion,
};

/// Where the diffusers weight layout is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl ModelSource {
    /// An existing directory is used as is, anything else is taken as a Hub repository id.
    pub fn resolve(model: &str) -> Self {
        let path = Path::new(model);
        if path.is_dir() {
            ModelSource::Local(path.to_path_buf())
        } else {
            ModelSource::Hub(model.to_string())
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
            ModelSource::Hub(repo) => f.write_str(repo),
        }
    }
}

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
    StableDiffusionXl,
    StableDiffusion3,
    Flux,
}

impl ModelType {
    /// Detect model type from model name, anything unrecognised is treated as Stable Diffusion.
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            ModelType::Flux
        } else if name_upper.contains("SD3") || name_upper.contains("DIFFUSION-3") {
            ModelType::StableDiffusion3
        } else if name_upper.contains("XL") {
            ModelType::StableDiffusionXl
        } else {
            ModelType::StableDiffusion
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVersion),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        match ModelType::from_name(model_name) {
            ModelType::StableDiffusion => Some(ModelVariant::StableDiffusion(
                StableDiffusionVersion::from_name(model_name),
            )),
            _ => None,
        }
    }
}

fn hub_api(config: &PipelineConfig) -> Result<Api> {
    Ok(ApiBuilder::new()
        .with_token(config.hf_token.clone())
        .with_progress(true)
        .build()?)
}

/// Load the pipeline named by `config.model`, automatically detecting the appropriate loader
pub async fn load_model(config: &PipelineConfig) -> Result<Arc<dyn ImageModel>> {
    let model_name = config.model.as_str();
    let model_type = ModelType::from_name(model_name);
    let model_variant = ModelVariant::from_name(model_name).ok_or_else(|| {
        Error::UnsupportedModel(format!(
            "{model_name} (detected type {model_type:?} is recognized but not yet implemented)"
        ))
    })?;

    info!(
        "Loading model: {} (detected type: {:?}/variant: {:?})",
        model_name, model_type, model_variant
    );

    let source = ModelSource::resolve(model_name);
    let api = hub_api(config)?;
    match model_variant {
        ModelVariant::StableDiffusion(version) => {
            let model = StableDiffusionLoader::load(version, source, api, config).await?;
            Ok(Arc::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("stable-diffusion-v1-5/stable-diffusion-v1-5", ModelType::StableDiffusion)]
    #[case("stabilityai/stable-diffusion-xl-base-1.0", ModelType::StableDiffusionXl)]
    #[case("stabilityai/stable-diffusion-3-medium", ModelType::StableDiffusion3)]
    #[case("black-forest-labs/FLUX.1-schnell", ModelType::Flux)]
    fn detects_model_type(#[case] name: &str, #[case] expected: ModelType) {
        assert_eq!(ModelType::from_name(name), expected);
    }

    #[test]
    fn only_stable_diffusion_has_a_variant() {
        assert_eq!(
            ModelVariant::from_name("stabilityai/stable-diffusion-2-1"),
            Some(ModelVariant::StableDiffusion(StableDiffusionVersion::V2_1))
        );
        assert_eq!(ModelVariant::from_name("black-forest-labs/FLUX.1-dev"), None);
    }

    #[test]
    fn existing_directory_is_a_local_source() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().to_string_lossy().into_owned();

        assert_eq!(
            ModelSource::resolve(&name),
            ModelSource::Local(dir.path().to_path_buf())
        );
        assert_eq!(
            ModelSource::resolve("runwayml/stable-diffusion-v1-5"),
            ModelSource::Hub("runwayml/stable-diffusion-v1-5".to_string())
        );
    }

    #[tokio::test]
    async fn unsupported_model_is_rejected_before_download() {
        let config = PipelineConfig {
            model: "black-forest-labs/FLUX.1-schnell".to_string(),
            ..Default::default()
        };

        let err = load_model(&config).await.err().unwrap();

        assert!(matches!(err, Error::UnsupportedModel(_)));
    }
}
