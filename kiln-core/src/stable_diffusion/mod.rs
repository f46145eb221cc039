use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, schedulers::PredictionType,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::{Api, ApiRepo};
use image::DynamicImage;
use tempfile::NamedTempFile;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod scheduler;

pub use scheduler::SchedulerKind;

use crate::{
    config::PipelineConfig,
    device_label,
    lora::{fuse_weights_file, LoraTarget, LoraWeights},
    optimization::{probe_optimizations, OptimizationReport},
    resolve_adapter,
    sampling::{decoded_to_image, initial_latents, LATENT_CHANNELS},
    AdapterReference, Error, ImageModel, Loader,
    ModelInfo, ModelSource, Result, SamplingParams,
};

/// Scaling factor between the VAE latent space and the UNet latent space.
const VAE_SCALE: f64 = 0.18215;
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    /// 768px checkpoint trained with v-prediction.
    V2_1,
    /// 512px checkpoint trained with epsilon prediction.
    V2_1Base,
}

impl StableDiffusionVersion {
    /// Detects the version from a repository id or directory name, defaulting to v1.5.
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();
        let is_v2 = ["2-1", "2.1", "2_1", "V2"]
            .iter()
            .any(|marker| name_upper.contains(marker));

        if !is_v2 {
            StableDiffusionVersion::V1_5
        } else if name_upper.contains("BASE") {
            StableDiffusionVersion::V2_1Base
        } else {
            StableDiffusionVersion::V2_1
        }
    }

    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 | Self::V2_1Base => {
                StableDiffusionConfig::v2_1(sliced_attention_size, None, None)
            }
        }
    }

    fn prediction_type(self) -> PredictionType {
        match self {
            Self::V2_1 => PredictionType::VPrediction,
            Self::V1_5 | Self::V2_1Base => PredictionType::Epsilon,
        }
    }
}

/// Weight file names to try in order, preferring the half precision variant for f16.
fn weight_candidates(stem: &str, dtype: DType) -> Vec<String> {
    let full = format!("{stem}.safetensors");
    if dtype == DType::F16 {
        vec![format!("{stem}.fp16.safetensors"), full]
    } else {
        vec![full]
    }
}

enum WeightSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl WeightSource {
    fn new(source: &ModelSource, api: &Api) -> Self {
        match source {
            ModelSource::Local(dir) => Self::Local(dir.clone()),
            ModelSource::Hub(repo) => Self::Hub(api.model(repo.clone())),
        }
    }

    async fn fetch(&self, candidates: &[String]) -> Result<PathBuf> {
        let mut failures = Vec::new();
        for name in candidates {
            match self {
                Self::Local(dir) => {
                    let path = dir.join(name);
                    if path.is_file() {
                        return Ok(path);
                    }
                    failures.push(format!("{name}: not found"));
                }
                Self::Hub(repo) => match repo.get(name).await {
                    Ok(path) => return Ok(path),
                    Err(err) => {
                        debug!("weight file {name} unavailable: {err}");
                        failures.push(format!("{name}: {err}"));
                    }
                },
            }
        }
        Err(Error::weights(failures.join("; ")))
    }

    async fn tokenizer(&self, api: &Api) -> Result<PathBuf> {
        if let Self::Local(dir) = self {
            let local = dir.join("tokenizer").join("tokenizer.json");
            if local.is_file() {
                return Ok(local);
            }
        }
        Ok(api.model(TOKENIZER_REPO.to_string()).get("tokenizer.json").await?)
    }
}

struct WeightFiles {
    unet: PathBuf,
    vae: PathBuf,
    text_encoder: PathBuf,
    tokenizer: PathBuf,
}

/// Staged copies of the weights with the adapter fused in; dropping them deletes the files.
#[derive(Default)]
struct FusedWeights {
    unet: Option<NamedTempFile>,
    text_encoder: Option<NamedTempFile>,
}

fn fuse_adapter(
    files: &WeightFiles,
    lora: &LoraWeights,
    config: &PipelineConfig,
) -> Result<FusedWeights> {
    let staging_dir = config.staging_dir();
    let unet = fuse_weights_file(
        &files.unet,
        lora,
        LoraTarget::Unet,
        config.lora_scale,
        &staging_dir,
    )?;
    let text_encoder = fuse_weights_file(
        &files.text_encoder,
        lora,
        LoraTarget::TextEncoder,
        config.lora_scale,
        &staging_dir,
    )?;

    let fused = unet.as_ref().map_or(0, |(_, n)| *n) + text_encoder.as_ref().map_or(0, |(_, n)| *n);
    if fused == 0 {
        return Err(Error::weights(
            "LoRA adapter matched no weights of the base model",
        ));
    }
    info!(fused, scale = config.lora_scale, "LoRA weights fused");
    Ok(FusedWeights {
        unet: unet.map(|(file, _)| file),
        text_encoder: text_encoder.map(|(file, _)| file),
    })
}

fn staged_or<'a>(staged: &'a Option<NamedTempFile>, original: &'a Path) -> &'a Path {
    staged.as_ref().map_or(original, |file| file.path())
}

pub struct StableDiffusionModel {
    model_id: String,
    device: Device,
    dtype: DType,
    prediction_type: PredictionType,
    scheduler: SchedulerKind,
    optimization: OptimizationReport,
    adapter: Option<AdapterReference>,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusionModel {
    fn encode_prompt(&self, prompt: &str) -> anyhow::Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            warn!(
                tokens = tokens.len(),
                max = self.max_tokens,
                "prompt is longer than the CLIP context and was truncated"
            );
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl ImageModel for StableDiffusionModel {
    fn run(&self, params: &SamplingParams<'_>) -> anyhow::Result<DynamicImage> {
        let use_guidance = params.guidance_scale > 1.0;

        // --- Text embeddings, unconditional first when guiding ---
        let cond = self.encode_prompt(params.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond = self.encode_prompt(params.negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        }
        .to_dtype(self.dtype)?;

        // --- Denoising loop ---
        let mut scheduler = self
            .scheduler
            .build(params.steps, self.prediction_type)
            .context("failed to build scheduler")?;
        let latents = initial_latents(params.seed, params.height, params.width, &self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let start = Instant::now();
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(
                step = index + 1,
                of = timesteps.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "denoising step"
            );
        }

        // --- Decode and post-process to an 8-bit RGB image ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        Ok(decoded_to_image(&decoded)?)
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: self.model_id.clone(),
            device: device_label(&self.device).to_string(),
            dtype: format!("{:?}", self.dtype).to_lowercase(),
            scheduler: self.scheduler.to_string(),
            optimization: format!("{:?}", self.optimization.selected),
            lora: self.adapter.clone(),
        }
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;
    type Variant = StableDiffusionVersion;

    async fn load(
        version: StableDiffusionVersion,
        source: ModelSource,
        api: Api,
        config: &PipelineConfig,
    ) -> Result<Self::Model> {
        // Configure device, precision and attention.
        let device = config.device_map().select()?;
        let dtype = config.precision.dtype_for(&device);
        let optimization = probe_optimizations(&config.memory_optimizations, &device);
        info!(
            device = device_label(&device),
            ?dtype,
            ?version,
            "Loading Stable Diffusion pipeline from {}",
            source
        );

        // Resolve the adapter before any download so a bad directory fails fast.
        let adapter = config.lora_dir.as_ref().map(resolve_adapter).transpose()?;

        // --- Fetch weight files ---
        let weights = WeightSource::new(&source, &api);
        let files = WeightFiles {
            unet: weights
                .fetch(&weight_candidates("unet/diffusion_pytorch_model", dtype))
                .await?,
            vae: weights
                .fetch(&weight_candidates("vae/diffusion_pytorch_model", dtype))
                .await?,
            text_encoder: weights
                .fetch(&weight_candidates("text_encoder/model", dtype))
                .await?,
            tokenizer: weights.tokenizer(&api).await?,
        };

        let config = config.clone();
        let model_id = source.to_string();
        tokio::task::spawn_blocking(move || -> Result<StableDiffusionModel> {
            let sd_config =
                version.config(optimization.sliced_attention_size(config.sliced_attention_size));

            let fused = match &adapter {
                Some(adapter) => {
                    info!("Loading LoRA weights from {}", adapter.path().display());
                    let lora = LoraWeights::load(adapter)?;
                    fuse_adapter(&files, &lora, &config)?
                }
                None => FusedWeights::default(),
            };

            let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(Error::weights)?;
            let pad_token = sd_config
                .clip
                .pad_with
                .as_deref()
                .unwrap_or(DEFAULT_PAD_TOKEN);
            let pad_id = tokenizer.token_to_id(pad_token).ok_or_else(|| {
                Error::weights(format!("tokenizer has no pad token `{pad_token}`"))
            })?;

            info!("Building text encoder");
            let text_model = build_clip_transformer(
                &sd_config.clip,
                staged_or(&fused.text_encoder, &files.text_encoder),
                &device,
                DType::F32,
            )?;
            info!("Building VAE");
            let vae = sd_config.build_vae(&files.vae, &device, dtype)?;
            info!("Building UNet");
            let unet = sd_config.build_unet(
                staged_or(&fused.unet, &files.unet),
                &device,
                LATENT_CHANNELS,
                optimization.use_flash_attn(),
                dtype,
            )?;
            info!(scheduler = %config.scheduler, "Pipeline ready");

            Ok(StableDiffusionModel {
                model_id,
                device,
                dtype,
                prediction_type: version.prediction_type(),
                scheduler: config.scheduler,
                optimization,
                adapter,
                tokenizer,
                pad_id,
                max_tokens: sd_config.clip.max_position_embeddings,
                text_model,
                vae,
                unet,
            })
        })
        .await
        .map_err(Error::weights)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("stable-diffusion-v1-5/stable-diffusion-v1-5", StableDiffusionVersion::V1_5)]
    #[case("runwayml/stable-diffusion-v1-5", StableDiffusionVersion::V1_5)]
    #[case("stabilityai/stable-diffusion-2-1", StableDiffusionVersion::V2_1)]
    #[case("stabilityai/stable-diffusion-2-1-base", StableDiffusionVersion::V2_1Base)]
    #[case("./models/pottery-finetune", StableDiffusionVersion::V1_5)]
    fn detects_version_from_name(#[case] name: &str, #[case] expected: StableDiffusionVersion) {
        assert_eq!(StableDiffusionVersion::from_name(name), expected);
    }

    #[test]
    fn adapter_matching_nothing_is_rejected() {
        let dir = TempDir::new().unwrap();
        let weight = |data: &[f32], shape: &[usize]| {
            Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
        };
        let unet_path = dir.path().join("unet.safetensors");
        let text_encoder_path = dir.path().join("text_encoder.safetensors");
        candle_core::safetensors::save(
            &std::collections::HashMap::from([(
                "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight".to_string(),
                weight(&[1.0, 0.0, 0.0, 1.0], &[2, 2]),
            )]),
            &unet_path,
        )
        .unwrap();
        candle_core::safetensors::save(
            &std::collections::HashMap::from([(
                "text_model.final_layer_norm.weight".to_string(),
                weight(&[1.0, 1.0], &[2]),
            )]),
            &text_encoder_path,
        )
        .unwrap();
        let files = WeightFiles {
            unet: unet_path,
            vae: dir.path().join("vae.safetensors"),
            text_encoder: text_encoder_path,
            tokenizer: dir.path().join("tokenizer.json"),
        };
        let lora = LoraWeights::from_tensors([
            (
                "unet.up_blocks.3.attentions.2.transformer_blocks.0.attn2.to_k.lora.down.weight"
                    .to_string(),
                weight(&[1.0, 0.0], &[1, 2]),
            ),
            (
                "unet.up_blocks.3.attentions.2.transformer_blocks.0.attn2.to_k.lora.up.weight"
                    .to_string(),
                weight(&[1.0, 1.0], &[2, 1]),
            ),
        ])
        .unwrap();
        let config = PipelineConfig {
            cache_dir: Some(dir.path().join("staging")),
            ..Default::default()
        };

        let err = fuse_adapter(&files, &lora, &config).err().unwrap();

        assert!(matches!(err, Error::WeightLoading(ref msg) if msg.contains("matched no weights")));
    }

    #[test]
    fn half_precision_prefers_fp16_files() {
        assert_eq!(
            weight_candidates("unet/diffusion_pytorch_model", DType::F16),
            vec![
                "unet/diffusion_pytorch_model.fp16.safetensors",
                "unet/diffusion_pytorch_model.safetensors"
            ]
        );
        assert_eq!(
            weight_candidates("text_encoder/model", DType::F32),
            vec!["text_encoder/model.safetensors"]
        );
    }

    #[tokio::test]
    async fn local_source_falls_back_to_full_precision() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("vae")).unwrap();
        std::fs::write(dir.path().join("vae/diffusion_pytorch_model.safetensors"), b"").unwrap();
        let api = Api::new().unwrap();
        let source = WeightSource::new(&ModelSource::Local(dir.path().to_path_buf()), &api);

        let path = source
            .fetch(&weight_candidates("vae/diffusion_pytorch_model", DType::F16))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("vae/diffusion_pytorch_model.safetensors"));
    }

    #[tokio::test]
    async fn local_source_reports_every_missing_candidate() {
        let dir = TempDir::new().unwrap();
        let api = Api::new().unwrap();
        let source = WeightSource::new(&ModelSource::Local(dir.path().to_path_buf()), &api);

        let err = source
            .fetch(&weight_candidates("unet/diffusion_pytorch_model", DType::F16))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("diffusion_pytorch_model.fp16.safetensors"));
        assert!(message.contains("diffusion_pytorch_model.safetensors: not found"));
    }
}
