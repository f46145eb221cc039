use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Memory optimizations tried in order when the pipeline is built; the first one the
/// device supports is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryOptimization {
    FlashAttention,
    SlicedAttention,
    Standard,
}

impl MemoryOptimization {
    pub fn default_order() -> Vec<Self> {
        vec![Self::FlashAttention, Self::SlicedAttention, Self::Standard]
    }

    fn probe(self, device: &Device) -> Result<(), &'static str> {
        match self {
            Self::FlashAttention if !cfg!(feature = "flash-attn") => {
                Err("built without the `flash-attn` feature")
            }
            Self::FlashAttention if !device.is_cuda() => Err("requires a CUDA device"),
            Self::SlicedAttention if device.is_cpu() => Err("no memory pressure on the CPU"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub selected: MemoryOptimization,
    pub rejected: Vec<(MemoryOptimization, String)>,
}

impl OptimizationReport {
    pub fn use_flash_attn(&self) -> bool {
        self.selected == MemoryOptimization::FlashAttention
    }

    /// Slice size for the UNet attention, `None` for the full attention.
    pub fn sliced_attention_size(&self, configured: usize) -> Option<usize> {
        match self.selected {
            MemoryOptimization::SlicedAttention if configured > 0 => Some(configured),
            // half of the eight attention heads, like diffusers' automatic slicing
            MemoryOptimization::SlicedAttention => Some(4),
            _ => None,
        }
    }
}

/// Walks `candidates` in order and picks the first optimization `device` supports,
/// falling back to the standard configuration.
pub fn probe_optimizations(candidates: &[MemoryOptimization], device: &Device) -> OptimizationReport {
    let mut rejected = Vec::new();
    for &candidate in candidates {
        match candidate.probe(device) {
            Ok(()) => {
                info!(optimization = ?candidate, "memory optimization enabled");
                return OptimizationReport { selected: candidate, rejected };
            }
            Err(reason) => {
                debug!(optimization = ?candidate, reason, "memory optimization unavailable");
                rejected.push((candidate, reason.to_string()));
            }
        }
    }
    info!("Using standard memory configuration");
    OptimizationReport {
        selected: MemoryOptimization::Standard,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_falls_through_to_standard() {
        let report = probe_optimizations(&MemoryOptimization::default_order(), &Device::Cpu);

        assert_eq!(report.selected, MemoryOptimization::Standard);
        let rejected: Vec<_> = report.rejected.iter().map(|(o, _)| *o).collect();
        assert_eq!(
            rejected,
            vec![
                MemoryOptimization::FlashAttention,
                MemoryOptimization::SlicedAttention
            ]
        );
        assert!(!report.use_flash_attn());
        assert_eq!(report.sliced_attention_size(4), None);
    }

    #[test]
    fn empty_candidate_list_is_standard() {
        let report = probe_optimizations(&[], &Device::Cpu);
        assert_eq!(report.selected, MemoryOptimization::Standard);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn sliced_attention_uses_configured_size() {
        let report = OptimizationReport {
            selected: MemoryOptimization::SlicedAttention,
            rejected: vec![],
        };
        assert_eq!(report.sliced_attention_size(0), Some(4));
        assert_eq!(report.sliced_attention_size(8), Some(8));
    }

    #[test]
    fn serde_names_are_kebab_case() {
        let parsed: Vec<MemoryOptimization> =
            serde_yaml::from_str("[flash-attention, sliced-attention, standard]").unwrap();
        assert_eq!(parsed, MemoryOptimization::default_order());
    }
}
