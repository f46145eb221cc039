use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Numeric precision the pipeline weights are loaded with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// f16 on accelerators, f32 on the CPU.
    #[default]
    Auto,
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn dtype_for(self, device: &Device) -> DType {
        match self {
            Self::Auto if device.is_cpu() => DType::F32,
            Self::Auto | Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            other => Err(format!("unknown precision `{other}` (auto, f16, bf16, f32)")),
        }
    }
}

impl DeviceMap {
    /// Opens the requested accelerator, falling back to the CPU when none was compiled in.
    pub fn select(self) -> Result<Device> {
        let ordinal = match self {
            Self::ForceCpu => return Ok(Device::Cpu),
            Self::Ordinal(ordinal) => ordinal,
        };
        if cuda_is_available() {
            return Ok(Device::new_cuda(ordinal)?);
        }
        if metal_is_available() {
            return Ok(Device::new_metal(ordinal)?);
        }
        let feature = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            "metal"
        } else {
            "cuda"
        };
        warn!("no GPU available, generating on the CPU; build with `--features {feature}` to use one");
        Ok(Device::Cpu)
    }
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_is_honoured() {
        assert!(DeviceMap::ForceCpu.select().unwrap().is_cpu());
    }

    #[test]
    fn auto_precision_is_full_on_cpu() {
        assert_eq!(Precision::Auto.dtype_for(&Device::Cpu), DType::F32);
        assert_eq!(Precision::F16.dtype_for(&Device::Cpu), DType::F16);
    }

    #[test]
    fn parses_precision_aliases() {
        assert_eq!("fp16".parse::<Precision>(), Ok(Precision::F16));
        assert_eq!("BF16".parse::<Precision>(), Ok(Precision::Bf16));
        assert!("int8".parse::<Precision>().is_err());
    }
}
