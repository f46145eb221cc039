//! Client for a running `kiln-server`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7860";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, bad quality, distorted, plastic, artificial";
const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate pottery images using a kiln server")]
pub struct ClientArgs {
    /// API base URL
    #[arg(long = "api-url", env = "KILN_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Bearer token for servers behind authentication
    #[arg(long, env = "KILN_API_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check API health
    Health,
    /// Generate a single image
    Generate {
        /// Text description of the pottery
        prompt: String,
        #[command(flatten)]
        options: SamplingOptions,
        /// Random seed for reproducible results
        #[arg(long)]
        seed: Option<u64>,
        /// Output filename
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate multiple images from a prompts file, one prompt per line
    Batch {
        prompts_file: PathBuf,
        #[command(flatten)]
        options: SamplingOptions,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SamplingOptions {
    /// What to avoid in the image
    #[arg(long = "negative-prompt")]
    pub negative_prompt: Option<String>,
    /// Inference steps (10-50)
    #[arg(long, default_value_t = 20)]
    pub steps: usize,
    /// Guidance scale (1-20)
    #[arg(long, default_value_t = 7.5)]
    pub guidance: f64,
    #[arg(long, default_value_t = 512)]
    pub width: u32,
    #[arg(long, default_value_t = 512)]
    pub height: u32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            negative_prompt: None,
            steps: 20,
            guidance: 7.5,
            width: 512,
            height: 512,
        }
    }
}

#[derive(Serialize, Debug)]
struct GeneratePayload<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: usize,
    guidance_scale: f64,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Health {
    pub status: String,
    pub model_loaded: bool,
    pub device: Option<String>,
    #[serde(default)]
    pub lora_loaded: bool,
    #[serde(default)]
    pub runtime: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Generated {
    pub image: String,
    pub seed: Option<u64>,
    #[serde(default)]
    pub final_prompt: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(GENERATE_TIMEOUT)
                .build()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.api_base, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn read<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(anyhow!("API error {status}: {message}"))
    }

    pub async fn health(&self) -> Result<Health> {
        let response = self
            .request(reqwest::Method::GET, "/api/health")
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context("connection error")?;
        Self::read(response).await
    }

    pub async fn generate(
        &self,
        prompt: &str,
        options: &SamplingOptions,
        seed: Option<u64>,
    ) -> Result<Generated> {
        let payload = GeneratePayload {
            prompt,
            negative_prompt: options
                .negative_prompt
                .as_deref()
                .unwrap_or(DEFAULT_NEGATIVE_PROMPT),
            steps: options.steps,
            guidance_scale: options.guidance,
            width: options.width,
            height: options.height,
            seed,
        };
        let response = self
            .request(reqwest::Method::POST, "/api/generate")
            .json(&payload)
            .send()
            .await
            .context("connection error")?;
        Self::read(response).await
    }
}

/// `pottery_<first 30 chars, alphanumerics only>_<timestamp>.png`
pub fn default_output_name(prompt: &str, now: DateTime<Local>) -> PathBuf {
    let kept: String = prompt
        .chars()
        .take(30)
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe_prompt = kept.split_whitespace().collect::<Vec<_>>().join("_");
    PathBuf::from(format!(
        "pottery_{safe_prompt}_{}.png",
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Decodes the `data:image/png;base64,...` payload and writes it to `path`.
pub fn save_data_url(data_url: &str, path: &Path) -> Result<()> {
    let encoded = data_url
        .split_once(',')
        .map(|(_, data)| data)
        .ok_or_else(|| anyhow!("response image is not a data URL"))?;
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .context("response image is not valid base64")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Non-empty trimmed lines of a prompts file.
pub fn read_prompts(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("File not found: {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub async fn print_health(client: &ApiClient) -> Result<Health> {
    let health = client.health().await?;
    println!("API Health Check:");
    println!("   Status: {}", health.status);
    println!("   Model Loaded: {}", health.model_loaded);
    println!("   Device: {}", health.device.as_deref().unwrap_or("unknown"));
    println!("   LoRA Loaded: {}", health.lora_loaded);
    if let Some(runtime) = &health.runtime {
        println!("   Runtime: {runtime}");
    }
    Ok(health)
}

pub async fn generate_to_file(
    client: &ApiClient,
    prompt: &str,
    options: &SamplingOptions,
    seed: Option<u64>,
    output: Option<PathBuf>,
) -> Result<PathBuf> {
    println!("Generating pottery image...");
    println!("   Prompt: {prompt}");
    println!("   Steps: {}, Guidance: {}", options.steps, options.guidance);
    println!("   Size: {}x{}", options.width, options.height);

    let generated = client.generate(prompt, options, seed).await?;
    let output = output.unwrap_or_else(|| default_output_name(prompt, Local::now()));
    save_data_url(&generated.image, &output)?;

    println!("Image generated successfully!");
    println!("   Saved as: {}", output.display());
    match generated.seed {
        Some(seed) => println!("   Used seed: {seed}"),
        None => println!("   Used seed: Random"),
    }
    Ok(output)
}

/// Generates every prompt in turn; failures are reported and skipped.
pub async fn batch(
    client: &ApiClient,
    prompts: &[String],
    options: &SamplingOptions,
) -> Vec<PathBuf> {
    let mut saved = Vec::new();
    for (i, prompt) in prompts.iter().enumerate() {
        println!("\nGenerating image {}/{}", i + 1, prompts.len());
        match generate_to_file(client, prompt, options, None, None).await {
            Ok(path) => saved.push(path),
            Err(e) => println!("Failed to generate image for: {prompt} ({e:#})"),
        }
    }
    println!(
        "\nBatch generation completed: {}/{} successful",
        saved.len(),
        prompts.len()
    );
    saved
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let client = ApiClient::new(&args.api_url, args.token)?;
    match args.command {
        Command::Health => {
            print_health(&client).await?;
        }
        Command::Generate {
            prompt,
            options,
            seed,
            output,
        } => {
            generate_to_file(&client, &prompt, &options, seed, output).await?;
        }
        Command::Batch {
            prompts_file,
            options,
        } => {
            let prompts = read_prompts(&prompts_file)?;
            if prompts.is_empty() {
                bail!("No prompts found in {}", prompts_file.display());
            }
            println!("Found {} prompts in {}", prompts.len(), prompts_file.display());
            let saved = batch(&client, &prompts, &options).await;
            if saved.is_empty() {
                bail!("every prompt in the batch failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case("elegant ceramic vase", "pottery_elegant_ceramic_vase_20250102_030405.png")]
    #[case("rustic pot!! (blue)", "pottery_rustic_pot_blue_20250102_030405.png")]
    #[case(
        "a very long prompt describing a tall amphora",
        "pottery_a_very_long_prompt_describing_20250102_030405.png"
    )]
    fn sanitizes_default_name(#[case] prompt: &str, #[case] expected: &str) {
        let now = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(default_output_name(prompt, now), PathBuf::from(expected));
    }

    #[test]
    fn rejects_non_data_url() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(save_data_url("not an image", &dir.path().join("x.png")).is_err());
    }

    #[test]
    fn parses_subcommands() {
        let args = ClientArgs::try_parse_from([
            "kiln-client",
            "--api-url",
            "http://gpu-box:7860",
            "generate",
            "rustic pot",
            "--steps",
            "25",
            "--guidance",
            "8.0",
            "--output",
            "my_pot.png",
        ])
        .unwrap();

        assert_eq!(args.api_url, "http://gpu-box:7860");
        match args.command {
            Command::Generate {
                prompt,
                options,
                output,
                ..
            } => {
                assert_eq!(prompt, "rustic pot");
                assert_eq!(options.steps, 25);
                assert_eq!(options.guidance, 8.0);
                assert_eq!(output, Some(PathBuf::from("my_pot.png")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
