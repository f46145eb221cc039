use kiln_core::{GeneratedArtifact, GenerationRequest, NormalizedPrompt};
use serde::{Deserialize, Serialize};

use crate::ApiError;

pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_SIZE: u32 = 512;
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, bad quality, distorted";

/// Sampling parameters shared by the single and batch endpoints.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GenerationParams {
    pub negative_prompt: Option<String>,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
    pub style: Option<String>,
    pub material: Option<String>,
    pub perspective: Option<String>,
    pub translate: Option<bool>,
}

impl GenerationParams {
    pub fn to_request(&self, prompt: &str) -> Result<GenerationRequest, ApiError> {
        let negative_prompt = self
            .negative_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string());
        Ok(GenerationRequest::builder(prompt)
            .style(self.style.as_deref())
            .material(self.material.as_deref())
            .perspective(self.perspective.as_deref())
            .negative_prompt(Some(negative_prompt))
            .steps(self.steps.unwrap_or(DEFAULT_STEPS))
            .guidance_scale(self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE))
            .size(
                self.width.unwrap_or(DEFAULT_SIZE),
                self.height.unwrap_or(DEFAULT_SIZE),
            )
            .seed(self.seed)
            .translate(self.translate.unwrap_or(true))
            .build()?)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct GenerateBody {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl GenerateBody {
    pub fn to_request(&self) -> Result<GenerationRequest, ApiError> {
        self.params.to_request(self.prompt.as_deref().unwrap_or_default())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct BatchBody {
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ParametersEcho {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Debug)]
pub struct GenerateResponse {
    pub prompt: String,
    pub final_prompt: String,
    pub image: String,
    pub seed: u64,
    pub parameters: ParametersEcho,
    pub translation: NormalizedPrompt,
}

impl GenerateResponse {
    pub fn from_artifact(artifact: GeneratedArtifact) -> Result<Self, ApiError> {
        let request = &artifact.request;
        Ok(Self {
            image: artifact.data_url()?,
            prompt: request.prompt().to_string(),
            parameters: ParametersEcho {
                steps: request.steps(),
                guidance_scale: request.guidance_scale(),
                width: request.width(),
                height: request.height(),
            },
            final_prompt: artifact.final_prompt,
            seed: artifact.seed,
            translation: artifact.normalization,
        })
    }
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum BatchItem {
    Success {
        prompt: String,
        image: String,
        seed: u64,
    },
    Failure {
        prompt: String,
        error: String,
    },
}

#[derive(Serialize, Debug)]
pub struct BatchResponse {
    pub results: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
}

impl FromIterator<BatchItem> for BatchResponse {
    fn from_iter<I: IntoIterator<Item = BatchItem>>(iter: I) -> Self {
        let results: Vec<BatchItem> = iter.into_iter().collect();
        let failed = results
            .iter()
            .filter(|item| matches!(item, BatchItem::Failure { .. }))
            .count();
        Self {
            succeeded: results.len() - failed,
            failed,
            results,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub device: Option<String>,
    pub lora_loaded: bool,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<kiln_core::ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
