use std::path::PathBuf;

use clap::Parser;
use kiln_core::{config::KilnConfig, Precision, SchedulerKind};

// Define command line arguments
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Kiln pottery image generation server")]
pub struct ServerArgs {
    /// YAML configuration file; flags below override its values
    #[arg(long, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Hugging Face repository id or local diffusers directory
    #[arg(long, env = "KILN_MODEL")]
    pub model: Option<String>,

    /// Directory holding the LoRA weights
    #[arg(long = "lora_dir", env = "KILN_LORA_DIR")]
    pub lora_dir: Option<PathBuf>,

    /// Blend scale of the LoRA weights
    #[arg(long = "lora_scale", env = "KILN_LORA_SCALE")]
    pub lora_scale: Option<f64>,

    /// Use CPU instead of GPU
    #[arg(long, env = "KILN_CPU")]
    pub cpu: bool,

    /// Weight precision: auto, f16, bf16 or f32
    #[arg(long, env = "KILN_PRECISION")]
    pub precision: Option<Precision>,

    /// Noise scheduler: uni-pc, ddim or euler-ancestral
    #[arg(long, env = "KILN_SCHEDULER")]
    pub scheduler: Option<SchedulerKind>,

    /// Base URL of the LibreTranslate service
    #[arg(long = "translate_url", env = "KILN_TRANSLATE_URL")]
    pub translate_url: Option<String>,

    /// Disable prompt translation
    #[arg(long = "no_translate", env = "KILN_NO_TRANSLATE")]
    pub no_translate: bool,

    /// Host address to bind the server to
    #[arg(long, env = "KILN_HOST")]
    pub host: Option<String>,

    /// Port to bind the server to
    #[arg(long, env = "KILN_PORT")]
    pub port: Option<u16>,

    /// Generations allowed to run at the same time
    #[arg(long = "max_concurrent", env = "KILN_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Default log level, `RUST_LOG` takes precedence
    #[arg(long = "log_level", env = "KILN_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ServerArgs {
    /// Loads the configuration file, if any, and applies the flags on top.
    pub fn resolve(&self) -> kiln_core::Result<KilnConfig> {
        let mut config = KilnConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut KilnConfig) {
        let pipeline = &mut config.pipeline;
        if let Some(model) = &self.model {
            pipeline.model = model.clone();
        }
        if let Some(dir) = &self.lora_dir {
            pipeline.lora_dir = Some(dir.clone());
        }
        if let Some(scale) = self.lora_scale {
            pipeline.lora_scale = scale;
        }
        pipeline.cpu |= self.cpu;
        if let Some(precision) = self.precision {
            pipeline.precision = precision;
        }
        if let Some(scheduler) = self.scheduler {
            pipeline.scheduler = scheduler;
        }

        if let Some(url) = &self.translate_url {
            config.translation.endpoint = url.clone();
        }
        if self.no_translate {
            config.translation.enabled = false;
        }

        let server = &mut config.server;
        if let Some(host) = &self.host {
            server.host = host.clone();
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(max) = self.max_concurrent {
            server.max_concurrent_generations = max;
        }
        if let Some(level) = &self.log_level {
            server.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_override_defaults() {
        let args = ServerArgs::try_parse_from([
            "kiln-server",
            "--lora_dir",
            "./lora-output",
            "--port",
            "8080",
            "--scheduler",
            "ddim",
            "--no_translate",
        ])
        .unwrap();

        let mut config = KilnConfig::default();
        args.apply(&mut config);

        assert_eq!(config.pipeline.lora_dir, Some(PathBuf::from("./lora-output")));
        assert_eq!(config.pipeline.scheduler, SchedulerKind::Ddim);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(!config.translation.enabled);
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let mut config = KilnConfig::default();
        config.pipeline.model = "./models/sd15".to_string();
        config.server.max_concurrent_generations = 2;

        ServerArgs::default().apply(&mut config);

        assert_eq!(config.pipeline.model, "./models/sd15");
        assert_eq!(config.server.max_concurrent_generations, 2);
    }
}
