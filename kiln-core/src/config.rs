use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    optimization::MemoryOptimization, DeviceMap, Precision, Result, SchedulerKind,
    DEFAULT_CONFIDENCE_THRESHOLD,
};

pub const DEFAULT_MODEL: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl KilnConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Reads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hugging Face repository id or local directory holding the diffusers layout.
    pub model: String,
    pub lora_dir: Option<PathBuf>,
    pub lora_scale: f64,
    pub precision: Precision,
    pub cpu: bool,
    pub scheduler: SchedulerKind,
    pub memory_optimizations: Vec<MemoryOptimization>,
    pub sliced_attention_size: usize,
    pub hf_token: Option<String>,
    /// Where fused LoRA weights are staged while the network is built.
    pub cache_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            lora_dir: None,
            lora_scale: 1.0,
            precision: Precision::Auto,
            cpu: false,
            scheduler: SchedulerKind::default(),
            memory_optimizations: MemoryOptimization::default_order(),
            sliced_attention_size: 0,
            hf_token: None,
            cache_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("kiln")))
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub confidence_threshold: f32,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:5000".to_string(),
            api_key: None,
            timeout_secs: 10,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_generations: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            max_concurrent_generations: 1,
            log_level: "info".to_string(),
        }
    }
}
