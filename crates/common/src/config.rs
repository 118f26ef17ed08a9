//! Typed experiment configuration.
//!
//! Built from an [`ExperimentSpec`] by the training modules. Nested
//! sub-configs (`model_config`, `optimizer_config`, ...) are deserialised
//! with serde defaults, so a minimal experiment only needs `steps`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ConfigError;
use crate::spec::{describe, key_to_string, value_as_f64, value_as_i64, ExperimentSpec};

// ── Model ───────────────────────────────────────────────────────────────────

/// Architecture hyper-parameters. `input_shape` and `n_classes` fall back to
/// the dataset's values when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(skip)]
    pub name: String,
    /// VGG depth: 11, 13, 16 or 19.
    #[serde(default)]
    pub version: Option<u32>,
    /// `[height, width, channels]`.
    #[serde(default)]
    pub input_shape: Option<Vec<usize>>,
    #[serde(default)]
    pub n_classes: Option<usize>,
    #[serde(default)]
    pub l2_reg: f64,
    /// Hidden sizes of the dense LeNet.
    #[serde(default = "default_layer_sizes")]
    pub layer_sizes: Vec<usize>,
}

fn default_layer_sizes() -> Vec<usize> {
    vec![300, 100]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "lenet".into(),
            version: None,
            input_shape: None,
            n_classes: None,
            l2_reg: 0.0,
            layer_sizes: default_layer_sizes(),
        }
    }
}

// ── Dataset ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_valid_batch_size")]
    pub valid_batch_size: usize,
    #[serde(default = "default_train_samples")]
    pub train_samples: usize,
    #[serde(default = "default_valid_samples")]
    pub valid_samples: usize,
    /// `[height, width, channels]` of generated samples.
    #[serde(default = "default_image_shape")]
    pub image_shape: Vec<usize>,
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,
    /// Scale of the per-sample noise around each class centre.
    #[serde(default = "default_noise")]
    pub noise: f32,
}

fn default_train_batch_size() -> usize {
    128
}
fn default_valid_batch_size() -> usize {
    512
}
fn default_train_samples() -> usize {
    2048
}
fn default_valid_samples() -> usize {
    512
}
fn default_image_shape() -> Vec<usize> {
    vec![28, 28, 1]
}
fn default_n_classes() -> usize {
    10
}
fn default_noise() -> f32 {
    1.0
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".into(),
            train_batch_size: default_train_batch_size(),
            valid_batch_size: default_valid_batch_size(),
            train_samples: default_train_samples(),
            valid_samples: default_valid_samples(),
            image_shape: default_image_shape(),
            n_classes: default_n_classes(),
            noise: default_noise(),
        }
    }
}

// ── Optimiser ───────────────────────────────────────────────────────────────

/// SGD-with-momentum settings. Non-empty `boundaries` switch the learning
/// rate to a piecewise-constant schedule over `values`
/// (`values.len() == boundaries.len() + 1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub boundaries: Vec<usize>,
    #[serde(default)]
    pub values: Vec<f64>,
    /// Decay after warmup when no piecewise schedule is given:
    /// `none`, `cosine` or `linear` (over the experiment's `steps`).
    #[serde(default = "default_decay")]
    pub decay: String,
    #[serde(default)]
    pub lr_min: f64,
    #[serde(default)]
    pub warmup_steps: usize,
}

fn default_decay() -> String {
    "none".into()
}

fn default_learning_rate() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            nesterov: false,
            boundaries: Vec::new(),
            values: Vec::new(),
            decay: default_decay(),
            lr_min: 0.0,
            warmup_steps: 0,
        }
    }
}

impl OptimizerConfig {
    /// Mask optimiser defaults: large step, heavy Nesterov momentum.
    pub fn mask_default() -> Self {
        Self {
            learning_rate: 10.0,
            momentum: 0.999,
            nesterov: true,
            ..Default::default()
        }
    }

    fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if !self.boundaries.is_empty() && self.values.len() != self.boundaries.len() + 1 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!(
                    "piecewise schedule needs {} values for {} boundaries, got {}",
                    self.boundaries.len() + 1,
                    self.boundaries.len(),
                    self.values.len()
                ),
            });
        }
        if !["none", "cosine", "linear"].contains(&self.decay.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("unknown decay `{}` (expected none, cosine or linear)", self.decay),
            });
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "learning_rate must be positive".into(),
            });
        }
        Ok(())
    }
}

// ── Mask learning ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MaskConfig {
    pub activation: String,
    pub sampling: bool,
    pub initial_value: f64,
    /// Symmetric bound applied to mask logits after every update.
    pub clip: f64,
    /// Maximum logit change per step; gradients are clipped to `budget / lr`.
    pub grad_budget: f64,
    pub regularizer: String,
    /// Epoch → regularisation coefficient; looked up as a step function.
    pub regularization: BTreeMap<usize, f64>,
    pub optimizer: OptimizerConfig,
    pub train_kernels: bool,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            activation: "sigmoid".into(),
            sampling: false,
            initial_value: 5.0,
            clip: 10.0,
            grad_budget: 0.1,
            regularizer: "activated".into(),
            regularization: BTreeMap::from([(0, 0.0)]),
            optimizer: OptimizerConfig::mask_default(),
            train_kernels: true,
        }
    }
}

// ── Phases ──────────────────────────────────────────────────────────────────

/// Stage configuration for the checkpoint-driven phase controller.
#[derive(Debug, Clone, Default)]
pub struct PhaseConfig {
    pub pruning: String,
    pub pruning_config: Value,
    pub load_model_before_pruning: Option<String>,
    /// A checkpoint path, or `random` for a fresh initialisation.
    pub load_model_after_pruning: Option<String>,
    pub load_optimizer: Option<String>,
    pub save_model: BTreeMap<i64, String>,
    pub save_optim: BTreeMap<i64, String>,
    pub steps: usize,
    pub steps_per_epoch: usize,
    pub initial_epoch: usize,
    pub reference_checkpoint: Option<String>,
    pub force_sparsity: Option<f64>,
    pub freeze_threshold: Option<f64>,
}

impl PhaseConfig {
    /// `steps_per_epoch` clamped to never exceed `steps`.
    pub fn effective_steps_per_epoch(&self) -> usize {
        self.steps_per_epoch.min(self.steps).max(1)
    }

    pub fn num_epochs(&self) -> usize {
        self.steps / self.effective_steps_per_epoch()
    }
}

// ── ExperimentConfig ────────────────────────────────────────────────────────

/// Everything a training module reads from its experiment.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub precision: u32,
    pub optimizer: OptimizerConfig,
    pub mask: MaskConfig,
    pub phases: PhaseConfig,
    pub seed: u64,
}

impl ExperimentConfig {
    pub fn from_spec(spec: &ExperimentSpec) -> Result<Self, ConfigError> {
        let mut model: ModelConfig = spec.deserialize_opt("model_config")?.unwrap_or_default();
        model.name = spec.str_or("model", "lenet")?.to_lowercase();

        let mut dataset: DatasetConfig =
            spec.deserialize_opt("dataset_config")?.unwrap_or_default();
        dataset.name = spec.str_or("dataset", "synthetic")?.to_lowercase();

        let precision = spec.usize_or("precision", 32)? as u32;
        if ![16, 32].contains(&precision) {
            return Err(ConfigError::InvalidValue {
                key: "precision".into(),
                reason: format!("must be 16 or 32, got {precision}"),
            });
        }

        let optimizer: OptimizerConfig =
            spec.deserialize_opt("optimizer_config")?.unwrap_or_default();
        optimizer.validate("optimizer_config")?;

        let defaults = MaskConfig::default();
        let mask_optimizer = spec
            .deserialize_opt("mask_optimizer_config")?
            .unwrap_or(defaults.optimizer);
        mask_optimizer.validate("mask_optimizer_config")?;
        let regularization = match spec.get("mask_regularization") {
            None | Some(Value::Null) => defaults.regularization,
            Some(v) => regularization_schedule(v)?,
        };
        let mask = MaskConfig {
            activation: spec.str_or("mask_activation", &defaults.activation)?,
            sampling: spec.bool_or("mask_sampling", defaults.sampling)?,
            initial_value: spec.f64_or("mask_initial_value", defaults.initial_value)?,
            clip: spec.f64_or("mask_clip", defaults.clip)?,
            grad_budget: spec.f64_or("mask_grad_budget", defaults.grad_budget)?,
            regularizer: spec.str_or("mask_regularizer", &defaults.regularizer)?,
            regularization,
            optimizer: mask_optimizer,
            train_kernels: spec.bool_or("train_kernels", defaults.train_kernels)?,
        };

        let steps = spec.usize_opt("steps")?.ok_or_else(|| ConfigError::MissingKey {
            key: "steps".into(),
        })?;
        if steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "steps".into(),
                reason: "must be positive".into(),
            });
        }
        let steps_per_epoch = spec.usize_or("steps_per_epoch", steps)?;
        if steps_per_epoch == 0 {
            return Err(ConfigError::InvalidValue {
                key: "steps_per_epoch".into(),
                reason: "must be positive".into(),
            });
        }

        let phases = PhaseConfig {
            pruning: spec.str_or("pruning", "none")?.to_lowercase(),
            pruning_config: spec.get("pruning_config").cloned().unwrap_or(Value::Null),
            load_model_before_pruning: spec.str_opt("load_model_before_pruning")?,
            load_model_after_pruning: spec.str_opt("load_model_after_pruning")?,
            load_optimizer: spec.str_opt("load_optimizer")?,
            save_model: epoch_map(spec, "save_model")?,
            save_optim: epoch_map(spec, "save_optim")?,
            steps,
            steps_per_epoch,
            initial_epoch: spec.usize_or("initial_epoch", 0)?,
            reference_checkpoint: spec.str_opt("reference_checkpoint")?,
            force_sparsity: spec.f64_opt("force_sparsity")?,
            freeze_threshold: spec.f64_opt("freeze_threshold")?,
        };
        if let Some(s) = phases.force_sparsity {
            if !(0.0..1.0).contains(&s) {
                return Err(ConfigError::InvalidValue {
                    key: "force_sparsity".into(),
                    reason: format!("must be in [0, 1), got {s}"),
                });
            }
        }

        let seed = spec.i64_opt("RND_IDX")?.unwrap_or(0) as u64;

        Ok(Self {
            model,
            dataset,
            precision,
            optimizer,
            mask,
            phases,
            seed,
        })
    }
}

/// A scalar means "this coefficient from epoch 0"; a mapping lists the
/// epochs at which the coefficient changes.
fn regularization_schedule(value: &Value) -> Result<BTreeMap<usize, f64>, ConfigError> {
    let key = "mask_regularization";
    match value {
        Value::Mapping(m) => {
            let mut out = BTreeMap::new();
            for (k, v) in m {
                let epoch = value_as_i64(k)
                    .filter(|e| *e >= 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: key.into(),
                        reason: format!("epoch `{}` is not a non-negative integer", key_to_string(k)),
                    })?;
                let coef = value_as_f64(v).ok_or_else(|| ConfigError::InvalidType {
                    key: key.into(),
                    expected: "a number",
                    found: describe(v),
                })?;
                out.insert(epoch as usize, coef);
            }
            Ok(out)
        }
        other => value_as_f64(other)
            .map(|c| BTreeMap::from([(0, c)]))
            .ok_or_else(|| ConfigError::InvalidType {
                key: key.into(),
                expected: "a number or an {epoch: coefficient} mapping",
                found: describe(other),
            }),
    }
}

/// `{epoch: path}` checkpoint maps; epoch `-1` means "before training".
fn epoch_map(spec: &ExperimentSpec, key: &str) -> Result<BTreeMap<i64, String>, ConfigError> {
    let mut out = BTreeMap::new();
    match spec.get(key) {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(m)) => {
            for (k, v) in m {
                let epoch = value_as_i64(k).ok_or_else(|| ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!("epoch `{}` is not an integer", key_to_string(k)),
                })?;
                let path = v.as_str().ok_or_else(|| ConfigError::InvalidType {
                    key: key.into(),
                    expected: "a path string",
                    found: describe(v),
                })?;
                out.insert(epoch, path.to_string());
            }
        }
        Some(other) => {
            return Err(ConfigError::InvalidType {
                key: key.into(),
                expected: "an {epoch: path} mapping",
                found: describe(other),
            })
        }
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ExperimentSpec {
        ExperimentSpec::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn minimal_experiment_uses_defaults() {
        let cfg = ExperimentConfig::from_spec(&spec("steps: 100\n")).unwrap();
        assert_eq!(cfg.model.name, "lenet");
        assert_eq!(cfg.model.layer_sizes, vec![300, 100]);
        assert_eq!(cfg.dataset.name, "synthetic");
        assert_eq!(cfg.phases.pruning, "none");
        assert_eq!(cfg.phases.steps_per_epoch, 100);
        assert_eq!(cfg.mask.optimizer.learning_rate, 10.0);
        assert_eq!(cfg.mask.regularization.get(&0), Some(&0.0));
    }

    #[test]
    fn steps_are_required() {
        let err = ExperimentConfig::from_spec(&spec("model: lenet\n")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn steps_per_epoch_is_clamped_to_steps() {
        let cfg = ExperimentConfig::from_spec(&spec("steps: 50\nsteps_per_epoch: 80\n")).unwrap();
        assert_eq!(cfg.phases.effective_steps_per_epoch(), 50);
        assert_eq!(cfg.phases.num_epochs(), 1);

        let cfg = ExperimentConfig::from_spec(&spec("steps: 200\nsteps_per_epoch: 20\n")).unwrap();
        assert_eq!(cfg.phases.num_epochs(), 10);
    }

    #[test]
    fn epoch_maps_accept_negative_epochs() {
        let cfg = ExperimentConfig::from_spec(&spec(
            "steps: 10\nsave_model:\n  -1: ckp/init.safetensors\n  0: ckp/0.safetensors\n",
        ))
        .unwrap();
        assert_eq!(cfg.phases.save_model.get(&-1).unwrap(), "ckp/init.safetensors");
        assert_eq!(cfg.phases.save_model.len(), 2);
    }

    #[test]
    fn regularization_accepts_scalar_or_schedule() {
        let cfg =
            ExperimentConfig::from_spec(&spec("steps: 10\nmask_regularization: 1.0e-7\n")).unwrap();
        assert_eq!(cfg.mask.regularization, BTreeMap::from([(0, 1e-7)]));

        let cfg = ExperimentConfig::from_spec(&spec(
            "steps: 10\nmask_regularization:\n  0: 1.0e-7\n  4: 2.0e-7\n",
        ))
        .unwrap();
        assert_eq!(cfg.mask.regularization.len(), 2);
    }

    #[test]
    fn unknown_model_config_fields_fail_fast() {
        let err = ExperimentConfig::from_spec(&spec("steps: 10\nmodel_config:\n  depth: 3\n"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn piecewise_schedule_shape_is_validated() {
        let err = ExperimentConfig::from_spec(&spec(
            "steps: 10\noptimizer_config:\n  boundaries: [10, 20]\n  values: [0.1]\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
