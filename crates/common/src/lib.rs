//! # trune-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`ExperimentSpec`]** — one resolved experiment (ordered YAML mapping with
//!   parameter-usage tracking).
//! * **[`ExperimentConfig`]** — typed view over an experiment for the training modules.
//! * **[`Dataset`]** / **[`BatchDataset`]** — in-memory batching stand-ins for the
//!   dataset pipeline.
//! * **[`CancelToken`]** / **[`RunContext`]** — operator-cancel plumbing.

pub mod cancel;
pub mod config;
pub mod data;
pub mod error;
pub mod spec;

pub use cancel::{CancelToken, Cancelled, RunContext};
pub use config::{
    DatasetConfig, ExperimentConfig, MaskConfig, ModelConfig, OptimizerConfig, PhaseConfig,
};
pub use data::{batch_to_tensors, load_dataset, BatchDataset, Dataset, InMemoryDataset};
pub use error::ConfigError;
pub use spec::ExperimentSpec;

/// Name fragment shared by every mask tensor in a checkpoint.
///
/// Mask-preserving resets skip any tensor whose name contains it.
pub const MASK_KEYWORD: &str = "kernel_mask";
