//! Pruning methods: decide which weights survive by setting (and freezing)
//! every layer's mask.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Deserialize;
use serde_yaml::Value;

use trune_common::{CancelToken, ConfigError, Dataset, ExperimentConfig};
use trune_core::compare::candidate_scores;
use trune_core::{compare, compare_scores, MaskActivation, MaskedNet, Prunable};

use crate::checkpoint::load_checkpoint;
use crate::trainer::MaskedTrainer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Global,
    PerLayer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SparsityConfig {
    sparsity: f64,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LearnedConfig {
    steps: usize,
    #[serde(default)]
    reference: Option<PathBuf>,
    #[serde(default)]
    force_sparsity: Option<f64>,
    #[serde(default = "default_score_threshold")]
    threshold: f32,
}

fn default_score_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, PartialEq)]
pub enum PruningMethod {
    /// Every weight survives.
    None,
    /// Binarise whatever masks are currently loaded (nonzero survives).
    Keep,
    Magnitude { sparsity: f64, scope: Scope },
    /// Independent per-weight drop with probability `sparsity`.
    Random { sparsity: f64 },
    /// Learn masks for `steps` steps, then freeze at a score threshold chosen
    /// against `reference`, at `force_sparsity`, or at `threshold`.
    Learned {
        steps: usize,
        reference: Option<PathBuf>,
        force_sparsity: Option<f64>,
        threshold: f32,
    },
}

impl PruningMethod {
    pub fn from_config(name: &str, config: &Value) -> Result<Self, ConfigError> {
        let parse = |v: &Value| -> Result<SparsityConfig, ConfigError> {
            let c: SparsityConfig = serde_yaml::from_value(v.clone()).map_err(|e| invalid(e.to_string()))?;
            check_fraction(c.sparsity)?;
            Ok(c)
        };
        match name {
            "none" => Ok(Self::None),
            "keep" => Ok(Self::Keep),
            "magnitude" => {
                let c = parse(config)?;
                Ok(Self::Magnitude {
                    sparsity: c.sparsity,
                    scope: c.scope,
                })
            }
            "random" => Ok(Self::Random {
                sparsity: parse(config)?.sparsity,
            }),
            "learned" => {
                let c: LearnedConfig =
                    serde_yaml::from_value(config.clone()).map_err(|e| invalid(e.to_string()))?;
                if let Some(s) = c.force_sparsity {
                    check_fraction(s)?;
                }
                Ok(Self::Learned {
                    steps: c.steps,
                    reference: c.reference,
                    force_sparsity: c.force_sparsity,
                    threshold: c.threshold,
                })
            }
            other => Err(ConfigError::UnknownPruningMethod(other.to_string())),
        }
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: "pruning_config".into(),
        reason,
    }
}

fn check_fraction(s: f64) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&s) {
        Ok(())
    } else {
        Err(invalid(format!("sparsity must be in [0, 1), got {s}")))
    }
}

/// What the learned method needs beyond the model.
pub struct PruningContext<'a> {
    pub experiment: &'a ExperimentConfig,
    pub dataset: &'a Dataset,
    pub cancel: &'a CancelToken,
}

/// Decide and set every mask. Masks come out frozen.
pub fn set_pruning_masks(
    mut model: MaskedNet,
    method: &PruningMethod,
    ctx: &PruningContext<'_>,
) -> Result<MaskedNet> {
    match method {
        PruningMethod::None => {
            for layer in model.prunables_mut() {
                let ones = layer.kernel().as_tensor().ones_like()?;
                layer.set_mask(&ones)?;
            }
        }
        PruningMethod::Keep => {
            for layer in model.prunables_mut() {
                let current = layer.mask().var().ne(0f64)?.to_dtype(DType::F32)?;
                layer.set_mask(&current)?;
            }
        }
        PruningMethod::Magnitude { sparsity, scope } => {
            let scores = magnitude_scores(&model)?;
            match scope {
                Scope::Global => {
                    let flat: Vec<f32> = scores.iter().flatten().copied().collect();
                    let cut = magnitude_cut(&flat, *sparsity);
                    set_from_scores(&mut model, &scores, |_| cut)?;
                }
                Scope::PerLayer => {
                    let cuts: Vec<Option<f32>> =
                        scores.iter().map(|s| magnitude_cut(s, *sparsity)).collect();
                    set_from_scores(&mut model, &scores, |i| cuts[i])?;
                }
            }
        }
        PruningMethod::Random { sparsity } => {
            for layer in model.prunables_mut() {
                let kernel = layer.kernel().as_tensor();
                let draw = Tensor::rand(0f32, 1f32, kernel.shape(), kernel.device())?;
                let alive = layer.mask().var().ne(0f64)?.to_dtype(DType::F32)?;
                let keep = (draw.ge(*sparsity)?.to_dtype(DType::F32)? * alive)?;
                layer.set_mask(&keep)?;
            }
        }
        PruningMethod::Learned {
            steps,
            reference,
            force_sparsity,
            threshold,
        } => {
            model = learn_masks(model, *steps, reference.as_deref(), *force_sparsity, *threshold, ctx)?;
        }
    }
    tracing::info!(method = ?method, density = model.density()?, "pruning masks set");
    Ok(model)
}

/// Zero pruned weights in the stored kernels.
pub fn apply_pruning_masks(model: &MaskedNet) -> Result<()> {
    for layer in model.prunables() {
        layer.apply_mask()?;
    }
    Ok(())
}

/// `|kernel|`, zeroed where the current mask is already zero.
fn magnitude_scores(model: &MaskedNet) -> Result<Vec<Vec<f32>>> {
    model
        .prunables()
        .iter()
        .map(|layer| -> Result<Vec<f32>> {
            let alive = layer.mask().var().ne(0f64)?.to_dtype(DType::F32)?;
            let score = (layer.kernel().as_tensor().abs()? * alive)?;
            Ok(score.flatten_all()?.to_vec1::<f32>()?)
        })
        .collect()
}

/// Largest score that gets pruned, or `None` when nothing should be.
fn magnitude_cut(scores: &[f32], sparsity: f64) -> Option<f32> {
    let n_prune = (scores.len() as f64 * sparsity).round() as usize;
    if n_prune == 0 {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f32::total_cmp);
    Some(sorted[n_prune.min(sorted.len()) - 1])
}

fn set_from_scores(
    model: &mut MaskedNet,
    scores: &[Vec<f32>],
    cut: impl Fn(usize) -> Option<f32>,
) -> Result<()> {
    for (i, layer) in model.prunables_mut().into_iter().enumerate() {
        let keep: Vec<f32> = scores[i]
            .iter()
            .map(|&s| match cut(i) {
                Some(c) if s <= c => 0.0,
                _ => 1.0,
            })
            .collect();
        let kernel = layer.kernel().as_tensor();
        let mask = Tensor::from_vec(keep, kernel.shape(), kernel.device())?;
        layer.set_mask(&mask)?;
    }
    Ok(())
}

fn learn_masks(
    model: MaskedNet,
    steps: usize,
    reference: Option<&std::path::Path>,
    force_sparsity: Option<f64>,
    fallback_threshold: f32,
    ctx: &PruningContext<'_>,
) -> Result<MaskedNet> {
    let mut experiment = ctx.experiment.clone();
    experiment.phases.steps = steps.max(1);
    for m in model.masks() {
        m.fill(experiment.mask.initial_value)?;
    }
    let mut trainer = MaskedTrainer::new(model, &experiment)?;
    let mut stream = ctx.dataset.train_stream(experiment.seed);
    trainer.train_epoch(&mut stream, steps, 0, ctx.cancel)?;
    let mut model = trainer.model;

    let activation: MaskActivation = experiment.mask.activation.parse()?;
    let candidate: Vec<Tensor> = model.masks().iter().map(|m| m.logits().clone()).collect();
    let threshold = match (reference, force_sparsity) {
        (Some(path), _) => {
            let reference_net = model.fresh()?;
            load_checkpoint(&reference_net, path, None)?;
            let ref_masks: Vec<Tensor> =
                reference_net.masks().iter().map(|m| m.var().as_tensor().clone()).collect();
            let c = compare(&ref_masks, &candidate, activation, force_sparsity)?;
            tracing::info!(f1 = c.f1, precision = c.precision, recall = c.recall, threshold = c.threshold, "compared to reference");
            c.threshold
        }
        (None, Some(s)) => {
            let scores = candidate_scores(&candidate, activation)?;
            let labels = vec![true; scores.len()];
            compare_scores(&labels, &scores, Some(s))?.threshold
        }
        (None, None) => fallback_threshold,
    };
    for layer in model.prunables_mut() {
        layer.mask_mut().freeze_by_score(threshold)?;
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use trune_common::{load_dataset, DatasetConfig, ExperimentSpec, ModelConfig};
    use trune_core::MaskOptions;

    fn setup() -> (MaskedNet, ExperimentConfig, Dataset) {
        let spec = ExperimentSpec::from_value(serde_yaml::from_str("steps: 4\n").unwrap()).unwrap();
        let cfg = ExperimentConfig::from_spec(&spec).unwrap();
        let ds = load_dataset(
            &DatasetConfig {
                name: "synthetic".into(),
                image_shape: vec![2, 2, 1],
                n_classes: 2,
                train_samples: 16,
                valid_samples: 8,
                train_batch_size: 4,
                ..Default::default()
            },
            1,
        )
        .unwrap();
        let model_cfg = ModelConfig {
            name: "lenet".into(),
            layer_sizes: vec![10],
            ..Default::default()
        };
        let net = MaskedNet::new(&model_cfg, ds.input_shape, 2, &MaskOptions::default(), &Device::Cpu)
            .unwrap();
        (net, cfg, ds)
    }

    fn run(method: PruningMethod) -> MaskedNet {
        let (net, cfg, ds) = setup();
        let cancel = CancelToken::new();
        let ctx = PruningContext {
            experiment: &cfg,
            dataset: &ds,
            cancel: &cancel,
        };
        set_pruning_masks(net, &method, &ctx).unwrap()
    }

    #[test]
    fn parse_methods() {
        let cfg: Value = serde_yaml::from_str("{sparsity: 0.5, scope: per_layer}").unwrap();
        assert_eq!(
            PruningMethod::from_config("magnitude", &cfg).unwrap(),
            PruningMethod::Magnitude {
                sparsity: 0.5,
                scope: Scope::PerLayer
            }
        );
        assert!(matches!(
            PruningMethod::from_config("snip", &Value::Null),
            Err(ConfigError::UnknownPruningMethod(_))
        ));
        let bad: Value = serde_yaml::from_str("{sparsity: 1.5}").unwrap();
        assert!(PruningMethod::from_config("random", &bad).is_err());
    }

    #[test]
    fn none_keeps_everything_and_freezes() {
        let net = run(PruningMethod::None);
        assert!(net.masks().iter().all(|m| m.is_frozen()));
        assert_eq!(net.density().unwrap(), 1.0);
    }

    #[test]
    fn global_magnitude_hits_target_density() {
        let net = run(PruningMethod::Magnitude {
            sparsity: 0.5,
            scope: Scope::Global,
        });
        let d = net.density().unwrap();
        assert!((d - 0.5).abs() < 0.05, "density {d}");
    }

    #[test]
    fn per_layer_magnitude_prunes_each_layer() {
        let net = run(PruningMethod::Magnitude {
            sparsity: 0.5,
            scope: Scope::PerLayer,
        });
        for m in net.masks() {
            assert!((m.density().unwrap() - 0.5).abs() < 0.1);
        }
    }

    #[test]
    fn learned_masks_end_frozen() {
        let net = run(PruningMethod::Learned {
            steps: 2,
            reference: None,
            force_sparsity: Some(0.5),
            threshold: 0.5,
        });
        assert!(net.masks().iter().all(|m| m.is_frozen()));
        let d = net.density().unwrap();
        assert!(d > 0.0 && d <= 1.0);
    }

    #[test]
    fn apply_zeroes_pruned_kernel_entries() {
        let net = run(PruningMethod::Magnitude {
            sparsity: 0.5,
            scope: Scope::Global,
        });
        apply_pruning_masks(&net).unwrap();
        for layer in net.prunables() {
            let k = layer.kernel().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let m = layer.mask().var().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for (w, keep) in k.iter().zip(m) {
                if keep == 0.0 {
                    assert_eq!(*w, 0.0);
                }
            }
        }
    }
}
