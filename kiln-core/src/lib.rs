#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod adapter;
pub mod artifact;
pub mod config;
pub mod device_map;
pub mod error;
pub mod generator;
pub mod loader;
mod loader_factory;
pub mod logging;
pub mod lora;
pub mod optimization;
pub mod prompt;
pub mod request;
pub mod sampling;
pub mod translate;

mod stable_diffusion;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::*;
pub use artifact::*;
pub use device_map::*;
pub use error::{Error, Result};
pub use generator::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use prompt::*;
pub use request::*;
use serde::Serialize;
pub use stable_diffusion::{SchedulerKind, StableDiffusionLoader, StableDiffusionVersion};
pub use translate::*;

/// Fully resolved inputs for a single denoising run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub device: String,
    pub dtype: String,
    pub scheduler: String,
    pub optimization: String,
    pub lora: Option<AdapterReference>,
}

pub trait ImageModel: Send + Sync {
    fn run(&self, params: &SamplingParams<'_>) -> anyhow::Result<DynamicImage>;

    fn info(&self) -> ModelInfo;
}
