//! A deterministic stand-in for the diffusion pipeline, for tests that exercise everything
//! around the model without downloading weights.

use std::sync::Mutex;

use image::{DynamicImage, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{ImageModel, ModelInfo, SamplingParams};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
}

/// Paints uniform noise derived from the seed and prompt, and records every call.
#[derive(Debug, Default)]
pub struct SeededNoiseModel {
    calls: Mutex<Vec<RecordedCall>>,
    failure: Option<String>,
}

impl SeededNoiseModel {
    /// A model whose every run fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Mutex::default(),
            failure: Some(message.into()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

impl ImageModel for SeededNoiseModel {
    fn run(&self, params: &SamplingParams<'_>) -> anyhow::Result<DynamicImage> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: params.prompt.to_string(),
                negative_prompt: params.negative_prompt.to_string(),
                steps: params.steps,
                guidance_scale: params.guidance_scale,
                width: params.width,
                height: params.height,
                seed: params.seed,
            });
        }
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        if params.prompt.contains("[fail]") {
            anyhow::bail!("refusing prompt: {}", params.prompt);
        }

        let prompt_salt = params
            .prompt
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let mut rng = StdRng::seed_from_u64(params.seed ^ prompt_salt);
        let image = RgbImage::from_fn(params.width as u32, params.height as u32, |_, _| {
            image::Rgb(rng.gen())
        });
        Ok(DynamicImage::ImageRgb8(image))
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: "seeded-noise".to_string(),
            device: "cpu".to_string(),
            dtype: "u8".to_string(),
            scheduler: "none".to_string(),
            optimization: "Standard".to_string(),
            lora: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(seed: u64) -> SamplingParams<'static> {
        SamplingParams {
            prompt: "a jar",
            negative_prompt: "",
            steps: 1,
            guidance_scale: 7.5,
            width: 16,
            height: 8,
            seed,
        }
    }

    #[test]
    fn output_depends_only_on_inputs() {
        let model = SeededNoiseModel::default();

        let a = model.run(&params(42)).unwrap();
        let b = model.run(&params(42)).unwrap();
        let c = model.run(&params(7)).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_eq!((a.width(), a.height()), (16, 8));
        assert_eq!(model.call_count(), 3);
    }
}
