use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{
    config::KilnConfig, GeneratedArtifact, GenerationRequest, Generator, Precision,
    SchedulerKind, DEFAULT_GUIDANCE_SCALE, DEFAULT_SIZE, DEFAULT_STEPS,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Generate pottery images using Stable Diffusion.")]
pub struct GenerateArgs {
    /// Text prompt for pottery image
    #[arg(long)]
    pub prompt: String,

    /// Output image file
    #[arg(long, default_value = "output.png")]
    pub output: PathBuf,

    /// Model name or path
    #[arg(long)]
    pub model: Option<String>,

    /// Pottery style (e.g., Japanese Raku, Greek)
    #[arg(long)]
    pub style: Option<String>,

    /// Material/texture (e.g., glazed ceramic, earthenware)
    #[arg(long)]
    pub material: Option<String>,

    /// Camera perspective (e.g., side view, top-down)
    #[arg(long)]
    pub perspective: Option<String>,

    /// Guidance scale for diffusion
    #[arg(long = "guidance_scale", default_value_t = DEFAULT_GUIDANCE_SCALE)]
    pub guidance_scale: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    pub seed: Option<u64>,

    /// What to avoid in the image
    #[arg(long = "negative_prompt")]
    pub negative_prompt: Option<String>,

    /// Number of denoising steps
    #[arg(long, default_value_t = DEFAULT_STEPS)]
    pub steps: usize,

    /// Directory holding the LoRA weights
    #[arg(long = "lora_dir")]
    pub lora_dir: Option<PathBuf>,

    /// Blend scale of the LoRA weights
    #[arg(long = "lora_scale")]
    pub lora_scale: Option<f64>,

    /// Keep the prompt as typed, without translating it to English
    #[arg(long = "no_translate")]
    pub no_translate: bool,

    #[arg(long, default_value_t = DEFAULT_SIZE)]
    pub width: u32,

    #[arg(long, default_value_t = DEFAULT_SIZE)]
    pub height: u32,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Weight precision: auto, f16, bf16 or f32
    #[arg(long)]
    pub precision: Option<Precision>,

    /// Noise scheduler: uni-pc, ddim or euler-ancestral
    #[arg(long)]
    pub scheduler: Option<SchedulerKind>,

    /// Base URL of the LibreTranslate service
    #[arg(long = "translate_url")]
    pub translate_url: Option<String>,

    /// YAML configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl GenerateArgs {
    pub fn request(&self) -> kiln_core::Result<GenerationRequest> {
        GenerationRequest::builder(self.prompt.as_str())
            .style(self.style.as_deref())
            .material(self.material.as_deref())
            .perspective(self.perspective.as_deref())
            .negative_prompt(self.negative_prompt.as_deref())
            .steps(self.steps)
            .guidance_scale(self.guidance_scale)
            .size(self.width, self.height)
            .seed(self.seed)
            .translate(!self.no_translate)
            .build()
    }

    pub fn config(&self) -> kiln_core::Result<KilnConfig> {
        let mut config = KilnConfig::load(self.config.as_deref())?;
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
        Ok(config)
    }
}

/// Loads the pipeline described by `args` and writes one image.
pub async fn run(args: &GenerateArgs) -> Result<GeneratedArtifact> {
    // Reject bad input before spending time on the weights.
    let request = args.request()?;
    let config = args.config().context("failed to read configuration")?;

    println!("Loading model {}...", config.pipeline.model);
    if let Some(dir) = &config.pipeline.lora_dir {
        println!("Loading LoRA weights from {}", dir.display());
    }
    let start = Instant::now();
    let generator = Generator::from_config(&config)
        .await
        .context("failed to load the pipeline")?;
    println!("Model loaded in {:.1}s", start.elapsed().as_secs_f32());

    generate_to_file(&generator, request, &args.output).await
}

/// Runs `request` on an already built generator and saves the PNG to `output`.
pub async fn generate_to_file(
    generator: &Generator,
    request: GenerationRequest,
    output: &Path,
) -> Result<GeneratedArtifact> {
    println!("Generating image with {} steps...", request.steps());
    let start = Instant::now();
    let artifact = generator.generate(request).await?;
    if artifact.normalization.was_translated() {
        println!("Translated prompt: {}", artifact.final_prompt);
    }
    println!("Prompt: {}", artifact.final_prompt);
    println!("Seed: {}", artifact.seed);

    artifact
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Image saved to: {} ({:.1}s)",
        output.display(),
        start.elapsed().as_secs_f32()
    );
    Ok(artifact)
}
