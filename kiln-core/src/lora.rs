//! LoRA adapter loading and fusion.
//!
//! Adapter weights are merged into the base checkpoint (`W' = W + s * (alpha / r) * up * down`)
//! before the network is built, so the model code stays untouched. Diffusers, PEFT and kohya
//! key layouts are recognised; module paths are compared with dots flattened to underscores,
//! which is the form kohya uses.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{AdapterReference, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraTarget {
    Unet,
    TextEncoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Down,
    Up,
    Alpha,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoraKey {
    target: LoraTarget,
    module: String,
    role: Role,
}

const ROLE_SUFFIXES: [(&str, Role); 8] = [
    (".lora.down.weight", Role::Down),
    (".lora.up.weight", Role::Up),
    (".lora_A.weight", Role::Down),
    (".lora_B.weight", Role::Up),
    (".lora_down.weight", Role::Down),
    (".lora_up.weight", Role::Up),
    ("_lora.down.weight", Role::Down),
    ("_lora.up.weight", Role::Up),
];

fn parse_key(key: &str) -> Option<LoraKey> {
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);
    let (stem, role) = match key.strip_suffix(".alpha") {
        Some(stem) => (stem, Role::Alpha),
        None => ROLE_SUFFIXES
            .iter()
            .find_map(|&(suffix, role)| key.strip_suffix(suffix).map(|stem| (stem, role)))?,
    };

    // attention-processor layout: `attn1.processor.to_out_lora.up.weight`
    let mut stem = stem.replace(".processor.", ".");
    if key.contains(".processor.") && stem.ends_with(".to_out") {
        stem.push_str(".0");
    }

    let (target, module) = if let Some(rest) = stem.strip_prefix("unet.") {
        (LoraTarget::Unet, rest)
    } else if let Some(rest) = stem.strip_prefix("text_encoder.") {
        (LoraTarget::TextEncoder, rest)
    } else if let Some(rest) = stem.strip_prefix("lora_unet_") {
        (LoraTarget::Unet, rest)
    } else if let Some(rest) = stem
        .strip_prefix("lora_te1_")
        .or_else(|| stem.strip_prefix("lora_te_"))
    {
        (LoraTarget::TextEncoder, rest)
    } else {
        (LoraTarget::Unet, stem.as_str())
    };

    Some(LoraKey {
        target,
        module: flatten_module(module),
        role,
    })
}

fn flatten_module(path: &str) -> String {
    path.replace('.', "_")
}

#[derive(Debug, Default)]
struct LoraLayer {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f32>,
}

impl LoraLayer {
    fn delta(&self, module: &str, base: &Tensor, scale: f64) -> Result<Tensor> {
        let (Some(down), Some(up)) = (&self.down, &self.up) else {
            return Err(Error::weights(format!(
                "LoRA layer `{module}` is missing its up or down projection"
            )));
        };
        let rank = down.dim(0)?;
        let factor = scale * self.alpha.map_or(1.0, |alpha| alpha as f64 / rank as f64);

        // (out, r) x (r, in * kh * kw), reshaped to the base layout; covers linear and conv.
        let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
        let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = up.matmul(&down)?;
        if delta.elem_count() != base.elem_count() {
            return Err(Error::weights(format!(
                "LoRA layer `{module}` has shape {:?}, base weight has {:?}",
                delta.dims(),
                base.dims()
            )));
        }
        Ok(delta.reshape(base.shape())?.affine(factor, 0.0)?)
    }
}

/// Adapter weights grouped per target network and module.
#[derive(Debug, Default)]
pub struct LoraWeights {
    layers: HashMap<(LoraTarget, String), LoraLayer>,
}

impl LoraWeights {
    pub fn load(adapter: &AdapterReference) -> Result<Self> {
        let path = adapter.path();
        info!("Loading LoRA weights from {}", path.display());
        let tensors: Vec<(String, Tensor)> = if adapter.is_pickle() {
            candle_core::pickle::read_all(&path)?
        } else {
            candle_core::safetensors::load(&path, &Device::Cpu)?
                .into_iter()
                .collect()
        };
        Self::from_tensors(tensors)
    }

    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Result<Self> {
        let mut weights = Self::default();
        let mut skipped = 0usize;
        for (name, tensor) in tensors {
            let Some(key) = parse_key(&name) else {
                skipped += 1;
                continue;
            };
            let layer = weights
                .layers
                .entry((key.target, key.module))
                .or_default();
            match key.role {
                Role::Down => layer.down = Some(tensor),
                Role::Up => layer.up = Some(tensor),
                Role::Alpha => {
                    let values = tensor
                        .to_dtype(DType::F32)?
                        .flatten_all()?
                        .to_vec1::<f32>()?;
                    layer.alpha = values.first().copied();
                }
            }
        }
        if skipped > 0 {
            debug!(skipped, "ignored tensors that are not LoRA projections");
        }
        if weights.layers.is_empty() {
            return Err(Error::weights("file contains no LoRA layers"));
        }
        Ok(weights)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_count(&self, target: LoraTarget) -> usize {
        self.layers.keys().filter(|(t, _)| *t == target).count()
    }

    /// Adds the scaled LoRA deltas into `tensors`, returning how many weights were changed.
    pub fn fuse(
        &self,
        target: LoraTarget,
        tensors: &mut HashMap<String, Tensor>,
        scale: f64,
    ) -> Result<usize> {
        let index: HashMap<String, String> = tensors
            .keys()
            .filter_map(|name| {
                name.strip_suffix(".weight")
                    .map(|stem| (flatten_module(stem), name.clone()))
            })
            .collect();

        let mut fused = 0;
        let mut unmatched = Vec::new();
        for ((layer_target, module), layer) in &self.layers {
            if *layer_target != target {
                continue;
            }
            let Some(base_name) = index.get(module) else {
                unmatched.push(module.as_str());
                continue;
            };
            let base = &tensors[base_name];
            let delta = layer.delta(module, base, scale)?;
            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            tensors.insert(base_name.clone(), merged);
            fused += 1;
        }
        if !unmatched.is_empty() {
            warn!(
                ?target,
                count = unmatched.len(),
                first = unmatched[0],
                "LoRA layers without a matching base weight"
            );
        }
        Ok(fused)
    }
}

/// Writes a copy of the safetensors checkpoint at `base` with the adapter fused in.
///
/// Returns `None` when the adapter has no layers for `target`. The staged file is removed
/// when the returned handle is dropped, so keep it alive until the network is built.
pub fn fuse_weights_file(
    base: &Path,
    lora: &LoraWeights,
    target: LoraTarget,
    scale: f64,
    staging_dir: &Path,
) -> Result<Option<(NamedTempFile, usize)>> {
    if lora.layer_count(target) == 0 {
        return Ok(None);
    }
    let mut tensors = candle_core::safetensors::load(base, &Device::Cpu)?;
    let fused = lora.fuse(target, &mut tensors, scale)?;
    info!(?target, fused, "fused LoRA into {}", base.display());

    std::fs::create_dir_all(staging_dir)?;
    let file = tempfile::Builder::new()
        .prefix("kiln-fused-")
        .suffix(".safetensors")
        .tempfile_in(staging_dir)?;
    candle_core::safetensors::save(&tensors, file.path())?;
    Ok(Some((file, fused)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn base_weights() -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight".to_string(),
            t(&[1.0, 0.0, 0.0, 1.0], &[2, 2]),
        );
        tensors.insert(
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.bias".to_string(),
            t(&[0.0, 0.0], &[2]),
        );
        tensors
    }

    #[rstest]
    #[case::diffusers(
        "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora.down.weight",
        "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora.up.weight"
    )]
    #[case::peft(
        "base_model.model.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora_A.weight",
        "base_model.model.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora_B.weight"
    )]
    #[case::kohya(
        "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q.lora_down.weight",
        "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q.lora_up.weight"
    )]
    #[case::processor(
        "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora.down.weight",
        "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora.up.weight"
    )]
    fn fuses_every_key_layout(#[case] down_key: &str, #[case] up_key: &str) {
        let lora = LoraWeights::from_tensors([
            (down_key.to_string(), t(&[1.0, 0.0], &[1, 2])),
            (up_key.to_string(), t(&[1.0, 1.0], &[2, 1])),
        ])
        .unwrap();
        let mut tensors = base_weights();

        let fused = lora.fuse(LoraTarget::Unet, &mut tensors, 0.5).unwrap();

        assert_eq!(fused, 1);
        let merged = tensors["down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(merged, vec![vec![1.5, 0.0], vec![0.5, 1.0]]);
    }

    #[test]
    fn alpha_rescales_the_delta() {
        let prefix = "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q";
        let lora = LoraWeights::from_tensors([
            (format!("{prefix}.lora_down.weight"), t(&[1.0, 0.0, 0.0, 1.0], &[2, 2])),
            (format!("{prefix}.lora_up.weight"), t(&[1.0, 0.0, 0.0, 1.0], &[2, 2])),
            (format!("{prefix}.alpha"), t(&[1.0], &[1])),
        ])
        .unwrap();
        let mut tensors = base_weights();

        lora.fuse(LoraTarget::Unet, &mut tensors, 1.0).unwrap();

        // rank 2, alpha 1 -> factor 0.5
        let merged = tensors["down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(merged, vec![vec![1.5, 0.0], vec![0.0, 1.5]]);
    }

    #[test]
    fn conv_weights_are_reshaped() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "down_blocks.0.attentions.0.proj_in.weight".to_string(),
            Tensor::zeros((2, 2, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        let lora = LoraWeights::from_tensors([
            (
                "unet.down_blocks.0.attentions.0.proj_in.lora.down.weight".to_string(),
                t(&[1.0, 2.0], &[1, 2]),
            ),
            (
                "unet.down_blocks.0.attentions.0.proj_in.lora.up.weight".to_string(),
                t(&[1.0, 1.0], &[2, 1]),
            ),
        ])
        .unwrap();

        lora.fuse(LoraTarget::Unet, &mut tensors, 1.0).unwrap();

        let merged = &tensors["down_blocks.0.attentions.0.proj_in.weight"];
        assert_eq!(merged.dims(), &[2, 2, 1, 1]);
        assert_eq!(
            merged.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 1.0, 2.0]
        );
    }

    #[test]
    fn text_encoder_layers_are_kept_apart() {
        let lora = LoraWeights::from_tensors([
            (
                "text_encoder.text_model.encoder.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
                t(&[1.0, 0.0], &[1, 2]),
            ),
            (
                "text_encoder.text_model.encoder.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
                t(&[1.0, 1.0], &[2, 1]),
            ),
        ])
        .unwrap();
        assert_eq!(lora.layer_count(LoraTarget::TextEncoder), 1);
        assert_eq!(lora.layer_count(LoraTarget::Unet), 0);

        let mut unet = base_weights();
        assert_eq!(lora.fuse(LoraTarget::Unet, &mut unet, 1.0).unwrap(), 0);

        let mut text = HashMap::new();
        text.insert(
            "text_model.encoder.layers.0.self_attn.q_proj.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        assert_eq!(lora.fuse(LoraTarget::TextEncoder, &mut text, 1.0).unwrap(), 1);
    }

    #[test]
    fn half_projection_is_an_error() {
        let lora = LoraWeights::from_tensors([(
            "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora.down.weight"
                .to_string(),
            t(&[1.0, 0.0], &[1, 2]),
        )])
        .unwrap();
        let mut tensors = base_weights();

        assert!(matches!(
            lora.fuse(LoraTarget::Unet, &mut tensors, 1.0),
            Err(Error::WeightLoading(_))
        ));
    }

    #[test]
    fn file_without_lora_layers_is_rejected() {
        let err = LoraWeights::from_tensors([("conv_in.weight".to_string(), t(&[1.0], &[1]))])
            .unwrap_err();
        assert!(matches!(err, Error::WeightLoading(_)));
    }

    #[test]
    fn staged_file_holds_fused_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let base_path = dir.path().join("unet.safetensors");
        candle_core::safetensors::save(&base_weights(), &base_path).unwrap();
        let lora = LoraWeights::from_tensors([
            (
                "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora.down.weight"
                    .to_string(),
                t(&[1.0, 0.0], &[1, 2]),
            ),
            (
                "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora.up.weight"
                    .to_string(),
                t(&[1.0, 1.0], &[2, 1]),
            ),
        ])
        .unwrap();

        let (staged, fused) =
            fuse_weights_file(&base_path, &lora, LoraTarget::Unet, 1.0, dir.path())
                .unwrap()
                .unwrap();
        assert_eq!(fused, 1);

        let reloaded = candle_core::safetensors::load(staged.path(), &Device::Cpu).unwrap();
        let merged = reloaded["down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(merged, vec![vec![2.0, 0.0], vec![1.0, 1.0]]);

        assert!(
            fuse_weights_file(&base_path, &lora, LoraTarget::TextEncoder, 1.0, dir.path())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn parses_processor_output_projection() {
        let key = parse_key("unet.mid_block.attentions.0.transformer_blocks.0.attn2.processor.to_out_lora.up.weight")
            .unwrap();
        assert_eq!(key.module, "mid_block_attentions_0_transformer_blocks_0_attn2_to_out_0");
        assert_eq!(key.role, Role::Up);
    }
}
