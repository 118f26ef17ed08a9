//! Errors raised at mask and layer boundaries.

use thiserror::Error;
use trune_common::ConfigError;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("mask `{name}` has shape {expected:?}, refusing to assign {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("mask `{name}` is frozen and accepts no further updates")]
    Frozen { name: String },

    #[error("reference has {reference} elements but candidate has {candidate}")]
    LengthMismatch { reference: usize, candidate: usize },

    #[error("cannot compare empty mask sets")]
    Empty,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MaskError>;
