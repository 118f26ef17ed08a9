//! Configuration contract violations.
//!
//! Every variant is raised before training begins and aborts the invocation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key `{key}` is reserved and may not appear in an experiment document")]
    ReservedKey { key: String },

    #[error("missing required key `{key}`")]
    MissingKey { key: String },

    #[error("key `{key}`: expected {expected}, found {found}")]
    InvalidType {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("key `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("model `{0}` was not recognised (expected lenet, lenet_conv or vgg)")]
    UnknownModel(String),

    #[error("unknown version={version} for model `{model}`")]
    InvalidVersion { model: String, version: u32 },

    #[error("dataset `{0}` was not recognised (expected synthetic or test)")]
    UnknownDataset(String),

    #[error("pruning method `{0}` was not recognised")]
    UnknownPruningMethod(String),

    #[error("mask activation `{0}` was not recognised")]
    UnknownActivation(String),

    #[error("mask regularizer `{0}` was not recognised")]
    UnknownRegularizer(String),
}
