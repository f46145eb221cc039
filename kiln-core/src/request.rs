use serde::Serialize;

use crate::{Error, Result};

pub const DEFAULT_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_SIZE: u32 = 512;

/// A validated, immutable description of one image to generate.
///
/// Built through [`GenerationRequest::builder`], which rejects an empty prompt and
/// out-of-range sampling parameters before anything touches the model.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    style: Option<String>,
    material: Option<String>,
    perspective: Option<String>,
    negative_prompt: Option<String>,
    steps: usize,
    guidance_scale: f64,
    width: u32,
    height: u32,
    seed: Option<u64>,
    translate: bool,
}

impl GenerationRequest {
    pub fn builder(prompt: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            prompt: prompt.into(),
            style: None,
            material: None,
            perspective: None,
            negative_prompt: None,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            seed: None,
            translate: true,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    pub fn material(&self) -> Option<&str> {
        self.material.as_deref()
    }

    pub fn perspective(&self) -> Option<&str> {
        self.perspective.as_deref()
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt.as_deref()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn translate(&self) -> bool {
        self.translate
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    prompt: String,
    style: Option<String>,
    material: Option<String>,
    perspective: Option<String>,
    negative_prompt: Option<String>,
    steps: usize,
    guidance_scale: f64,
    width: u32,
    height: u32,
    seed: Option<u64>,
    translate: bool,
}

impl GenerationRequestBuilder {
    pub fn style(mut self, style: Option<impl Into<String>>) -> Self {
        self.style = style.map(Into::into);
        self
    }

    pub fn material(mut self, material: Option<impl Into<String>>) -> Self {
        self.material = material.map(Into::into);
        self
    }

    pub fn perspective(mut self, perspective: Option<impl Into<String>>) -> Self {
        self.perspective = perspective.map(Into::into);
        self
    }

    pub fn negative_prompt(mut self, negative_prompt: Option<impl Into<String>>) -> Self {
        self.negative_prompt = negative_prompt.map(Into::into);
        self
    }

    pub fn steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn translate(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }

    pub fn build(self) -> Result<GenerationRequest> {
        if self.prompt.trim().is_empty() {
            return Err(Error::EmptyPrompt);
        }
        if self.steps == 0 {
            return Err(Error::invalid("steps", "must be a positive integer"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(Error::invalid("guidance_scale", "must be a positive number"));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            // The VAE downsamples by 8, so latents need whole multiples of it.
            if value == 0 || value % 8 != 0 {
                return Err(Error::invalid(
                    name,
                    format!("{value} is not a positive multiple of 8"),
                ));
            }
        }

        Ok(GenerationRequest {
            prompt: self.prompt,
            style: non_blank(self.style),
            material: non_blank(self.material),
            perspective: non_blank(self.perspective),
            negative_prompt: non_blank(self.negative_prompt),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
            seed: self.seed,
            translate: self.translate,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
