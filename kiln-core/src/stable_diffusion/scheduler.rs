use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{PredictionType, Scheduler, SchedulerConfig},
    uni_pc::UniPCSchedulerConfig,
};
use serde::{Deserialize, Serialize};

/// Noise scheduler swapped in for the checkpoint's default PNDM scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Multistep UniPC solver, good results in 20-30 steps.
    #[default]
    #[serde(alias = "unipc")]
    UniPc,
    Ddim,
    /// Draws fresh noise every step from the device RNG, so it is not reproducible on the CPU.
    #[serde(alias = "euler_ancestral")]
    EulerAncestral,
}

impl SchedulerKind {
    pub fn build(
        self,
        steps: usize,
        prediction_type: PredictionType,
    ) -> candle_core::Result<Box<dyn Scheduler>> {
        match self {
            Self::UniPc => UniPCSchedulerConfig {
                prediction_type,
                ..Default::default()
            }
            .build(steps),
            Self::Ddim => DDIMSchedulerConfig {
                prediction_type,
                ..Default::default()
            }
            .build(steps),
            Self::EulerAncestral => EulerAncestralDiscreteSchedulerConfig {
                prediction_type,
                ..Default::default()
            }
            .build(steps),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UniPc => "uni-pc",
            Self::Ddim => "ddim",
            Self::EulerAncestral => "euler-ancestral",
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "uni-pc" | "unipc" => Ok(Self::UniPc),
            "ddim" => Ok(Self::Ddim),
            "euler-ancestral" | "euler-a" => Ok(Self::EulerAncestral),
            other => Err(format!(
                "unknown scheduler `{other}` (uni-pc, ddim, euler-ancestral)"
            )),
        }
    }
}
