//! Mask activations: the fixed monotonic map from mask logits to the
//! multiplier applied to a kernel weight.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use trune_common::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskActivation {
    Identity,
    #[default]
    Sigmoid,
    Tanh,
}

impl MaskActivation {
    /// Elementwise activation; differentiable through candle's autograd.
    pub fn apply(&self, logits: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Identity => Ok(logits.clone()),
            // 1 / (1 + e^-x) from primitive ops keeps the backward pass available.
            Self::Sigmoid => (logits.neg()?.exp()? + 1.0)?.recip(),
            Self::Tanh => logits.tanh(),
        }
    }

    pub fn apply_scalar(&self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }
}

impl FromStr for MaskActivation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identity" | "linear" | "none" => Ok(Self::Identity),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            _ => Err(ConfigError::UnknownActivation(s.to_string())),
        }
    }
}

impl fmt::Display for MaskActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        })
    }
}
