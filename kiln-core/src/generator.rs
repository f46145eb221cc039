use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::{
    compose_request_prompt, config::KilnConfig, load_model, sampling::resolve_seed,
    FallbackReason, GeneratedArtifact, GenerationRequest, ImageModel, LanguageNormalizer,
    ModelInfo, NormalizedPrompt, Result, SamplingParams,
};

/// The loaded pipeline plus the prompt preprocessing in front of it.
///
/// Built once per process and shared behind an `Arc`; every call to [`Generator::generate`]
/// composes the prompt, normalizes its language, and runs the model on a blocking thread.
pub struct Generator {
    model: Arc<dyn ImageModel>,
    normalizer: Option<LanguageNormalizer>,
}

impl Generator {
    pub fn new(model: Arc<dyn ImageModel>) -> Self {
        Self {
            model,
            normalizer: None,
        }
    }

    pub fn with_normalizer(mut self, normalizer: LanguageNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Loads the pipeline and, when enabled, connects the translation service.
    pub async fn from_config(config: &KilnConfig) -> Result<Self> {
        let model = load_model(&config.pipeline).await?;
        let generator = Self::new(model);
        if !config.translation.enabled {
            info!("Prompt translation disabled");
            return Ok(generator);
        }
        Ok(generator.with_normalizer(LanguageNormalizer::from_config(&config.translation)?))
    }

    pub fn info(&self) -> ModelInfo {
        self.model.info()
    }

    /// Composes the request's prompt and translates it to English when needed.
    pub async fn prepare_prompt(&self, request: &GenerationRequest) -> NormalizedPrompt {
        let composed = compose_request_prompt(request);
        match &self.normalizer {
            Some(normalizer) if request.translate() => normalizer.normalize(&composed).await,
            _ => NormalizedPrompt::unchanged(composed, FallbackReason::Disabled),
        }
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact> {
        let normalization = self.prepare_prompt(&request).await;
        let final_prompt = normalization.text().to_string();
        let negative_prompt = request.negative_prompt().unwrap_or_default().to_string();
        let seed = resolve_seed(request.seed());
        info!(
            seed,
            steps = request.steps(),
            guidance_scale = request.guidance_scale(),
            "Generating image with prompt: {}",
            final_prompt
        );

        let model = Arc::clone(&self.model);
        let (steps, guidance_scale) = (request.steps(), request.guidance_scale());
        let (width, height) = (request.width() as usize, request.height() as usize);
        let prompt = final_prompt.clone();
        let start = Instant::now();
        let image = tokio::task::spawn_blocking(move || {
            model.run(&SamplingParams {
                prompt: &prompt,
                negative_prompt: &negative_prompt,
                steps,
                guidance_scale,
                width,
                height,
                seed,
            })
        })
        .await
        .map_err(|err| crate::Error::Inference(err.to_string()))?
        .map_err(|err| {
            warn!("Error generating image: {err:#}");
            crate::Error::Inference(format!("{err:#}"))
        })?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Image generated");

        Ok(GeneratedArtifact {
            image,
            request,
            final_prompt,
            seed,
            normalization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SeededNoiseModel;
    use crate::{Detection, Translator};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FailingTranslator;

    #[async_trait]
    impl Translator for FailingTranslator {
        async fn detect(&self, _text: &str) -> Result<Detection> {
            Err(crate::Error::Translation("service unreachable".to_string()))
        }

        async fn translate(&self, _: &str, _: Option<&str>, _: &str) -> Result<String> {
            Err(crate::Error::Translation("service unreachable".to_string()))
        }
    }

    fn generator() -> (Generator, Arc<SeededNoiseModel>) {
        let model = Arc::new(SeededNoiseModel::default());
        (Generator::new(model.clone()), model)
    }

    fn request(seed: Option<u64>) -> GenerationRequest {
        GenerationRequest::builder("A test pottery vase")
            .style(Some("Greek"))
            .material(Some("earthenware"))
            .perspective(Some("side view"))
            .size(64, 64)
            .seed(seed)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn same_seed_gives_identical_images() {
        let (generator, _) = generator();

        let first = generator.generate(request(Some(42))).await.unwrap();
        let second = generator.generate(request(Some(42))).await.unwrap();

        assert_eq!(first.seed, 42);
        assert_eq!(first.image.as_bytes(), second.image.as_bytes());
    }

    #[tokio::test]
    async fn missing_seed_is_drawn_and_reported() {
        let (generator, model) = generator();

        let artifact = generator.generate(request(None)).await.unwrap();

        assert_eq!(model.calls()[0].seed, artifact.seed);
    }

    #[tokio::test]
    async fn composed_prompt_reaches_the_model() {
        let (generator, model) = generator();

        let artifact = generator.generate(request(Some(1))).await.unwrap();

        let expected = "A test pottery vase, Greek style, earthenware, side view";
        assert_eq!(artifact.final_prompt, expected);
        assert_eq!(model.calls()[0].prompt, expected);
        assert_eq!((artifact.image.width(), artifact.image.height()), (64, 64));
    }

    #[tokio::test]
    async fn arabic_prompt_survives_translator_failure() {
        let model = Arc::new(SeededNoiseModel::default());
        let generator = Generator::new(model.clone())
            .with_normalizer(LanguageNormalizer::new(FailingTranslator));
        let request = GenerationRequest::builder("إناء فخاري")
            .size(64, 64)
            .seed(Some(3))
            .build()
            .unwrap();

        let artifact = generator.generate(request).await.unwrap();

        assert_eq!(artifact.final_prompt, "إناء فخاري");
        assert!(!artifact.normalization.was_translated());
        assert_eq!(model.calls()[0].prompt, "إناء فخاري");
    }

    #[tokio::test]
    async fn translation_can_be_skipped_per_request() {
        let generator = Generator::new(Arc::new(SeededNoiseModel::default()))
            .with_normalizer(LanguageNormalizer::new(FailingTranslator));
        let request = GenerationRequest::builder("vase")
            .translate(false)
            .build()
            .unwrap();

        let normalized = generator.prepare_prompt(&request).await;

        assert_eq!(
            normalized,
            NormalizedPrompt::unchanged("vase", FallbackReason::Disabled)
        );
    }

    #[tokio::test]
    async fn model_failure_is_an_inference_error() {
        let generator = Generator::new(Arc::new(SeededNoiseModel::failing("out of memory")));

        let err = generator.generate(request(Some(1))).await.unwrap_err();

        assert!(matches!(err, crate::Error::Inference(ref msg) if msg.contains("out of memory")));
    }
}
