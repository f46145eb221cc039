//! Best-effort translation of non-English prompts into English.
//!
//! The normalizer never fails: every detection or translation error is folded into
//! [`NormalizedPrompt::Unchanged`] together with the reason, so callers can tell a
//! translated prompt apart from one where translation was unavailable.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{config::TranslationConfig, Error, Result};

pub const TARGET_LANGUAGE: &str = "en";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

const ARABIC_RANGES: [(char, char); 5] = [
    ('\u{0600}', '\u{06FF}'),
    ('\u{0750}', '\u{077F}'),
    ('\u{08A0}', '\u{08FF}'),
    ('\u{FB50}', '\u{FDFF}'),
    ('\u{FE70}', '\u{FEFF}'),
];

pub fn contains_arabic(text: &str) -> bool {
    text.chars().any(|c| {
        ARABIC_RANGES
            .iter()
            .any(|&(start, end)| (start..=end).contains(&c))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub language: String,
    /// Normalized to `0.0..=1.0`.
    pub confidence: f32,
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Detection>;

    async fn translate(&self, text: &str, source: Option<&str>, target: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DetectionMethod {
    ArabicScript,
    Detected { confidence: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    Disabled,
    English,
    LowConfidence { language: String, confidence: f32 },
    DetectionFailed(String),
    TranslationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NormalizedPrompt {
    Translated {
        text: String,
        original: String,
        source_language: String,
        method: DetectionMethod,
    },
    Unchanged {
        text: String,
        reason: FallbackReason,
    },
}

impl NormalizedPrompt {
    pub fn unchanged(text: impl Into<String>, reason: FallbackReason) -> Self {
        Self::Unchanged {
            text: text.into(),
            reason,
        }
    }

    /// The prompt to hand to the model.
    pub fn text(&self) -> &str {
        match self {
            Self::Translated { text, .. } | Self::Unchanged { text, .. } => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Translated { text, .. } | Self::Unchanged { text, .. } => text,
        }
    }

    pub fn was_translated(&self) -> bool {
        matches!(self, Self::Translated { .. })
    }
}

pub struct LanguageNormalizer {
    translator: Box<dyn Translator>,
    confidence_threshold: f32,
}

impl LanguageNormalizer {
    pub fn new(translator: impl Translator + 'static) -> Self {
        Self {
            translator: Box::new(translator),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn from_config(config: &TranslationConfig) -> Result<Self> {
        let client = LibreTranslateClient::new(
            &config.endpoint,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self::new(client).with_confidence_threshold(config.confidence_threshold))
    }

    pub async fn normalize(&self, prompt: &str) -> NormalizedPrompt {
        if contains_arabic(prompt) {
            info!("detected Arabic text in prompt");
            return self
                .translate_or_fallback(prompt, "ar", DetectionMethod::ArabicScript)
                .await;
        }

        let detection = match self.translator.detect(prompt).await {
            Ok(detection) => detection,
            Err(e) => {
                warn!(error = %e, "language detection unavailable, keeping prompt as typed");
                return NormalizedPrompt::unchanged(
                    prompt,
                    FallbackReason::DetectionFailed(e.to_string()),
                );
            }
        };

        if detection.language == TARGET_LANGUAGE {
            return NormalizedPrompt::unchanged(prompt, FallbackReason::English);
        }
        if detection.confidence <= self.confidence_threshold {
            debug!(
                language = %detection.language,
                confidence = detection.confidence,
                "detection below threshold, keeping prompt"
            );
            return NormalizedPrompt::unchanged(
                prompt,
                FallbackReason::LowConfidence {
                    language: detection.language,
                    confidence: detection.confidence,
                },
            );
        }

        info!(
            language = %detection.language,
            confidence = detection.confidence,
            "detected non-English prompt"
        );
        let method = DetectionMethod::Detected {
            confidence: detection.confidence,
        };
        self.translate_or_fallback(prompt, &detection.language, method)
            .await
    }

    async fn translate_or_fallback(
        &self,
        prompt: &str,
        source: &str,
        method: DetectionMethod,
    ) -> NormalizedPrompt {
        match self
            .translator
            .translate(prompt, Some(source), TARGET_LANGUAGE)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                info!(original = %prompt, translated = %text, "translated prompt to English");
                NormalizedPrompt::Translated {
                    text,
                    original: prompt.to_string(),
                    source_language: source.to_string(),
                    method,
                }
            }
            Ok(_) => {
                warn!("translation service returned an empty text, using original prompt");
                NormalizedPrompt::unchanged(
                    prompt,
                    FallbackReason::TranslationFailed("empty translation".into()),
                )
            }
            Err(e) => {
                warn!(error = %e, "translation failed, using original prompt");
                NormalizedPrompt::unchanged(prompt, FallbackReason::TranslationFailed(e.to_string()))
            }
        }
    }
}

/// Client for a LibreTranslate-compatible service.
#[derive(Debug, Clone)]
pub struct LibreTranslateClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct DetectBody<'a> {
    q: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Serialize)]
struct TranslateBody<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct DetectedLanguage {
    language: String,
    confidence: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

impl LibreTranslateClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Translation(format!("{status}: {text}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Translator for LibreTranslateClient {
    async fn detect(&self, text: &str) -> Result<Detection> {
        let candidates: Vec<DetectedLanguage> = self
            .post(
                "/detect",
                &DetectBody {
                    q: text,
                    api_key: self.api_key.as_deref(),
                },
            )
            .await?;
        let best = candidates
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or_else(|| Error::Translation("no language detected".into()))?;
        // LibreTranslate reports percentages.
        Ok(Detection {
            language: best.language,
            confidence: best.confidence / 100.0,
        })
    }

    async fn translate(&self, text: &str, source: Option<&str>, target: &str) -> Result<String> {
        let response: TranslateResponse = self
            .post(
                "/translate",
                &TranslateBody {
                    q: text,
                    source: source.unwrap_or("auto"),
                    target,
                    format: "text",
                    api_key: self.api_key.as_deref(),
                },
            )
            .await?;
        Ok(response.translated_text)
    }
}
