//! Module entry points invoked by the run driver.
//!
//! Each takes the experiment and a [`RunContext`], trains, and writes its
//! results (`ACC`, `VALID_LOSS`, `FINAL_DENSITY`, ...) back into the
//! experiment so they land in the result log.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};

use trune_common::{load_dataset, Dataset, ExperimentConfig, ExperimentSpec, RunContext};
use trune_core::compare::candidate_scores;
use trune_core::{compare, compare_scores, Comparison, MaskActivation, MaskOptions, MaskedNet};

use crate::checkpoint::{load_checkpoint, EpochCheckpointer};
use crate::phase::PhaseController;
use crate::pruning::apply_pruning_masks;
use crate::trainer::MaskedTrainer;

/// Signature shared by every registered module.
pub type ModuleFn = fn(&mut ExperimentSpec, &RunContext) -> Result<()>;

/// `(name, entry point)` for every module this crate provides.
pub fn builtin_modules() -> Vec<(&'static str, ModuleFn)> {
    vec![("pruning", pruning), ("mask_learning", mask_learning)]
}

struct Prepared {
    config: ExperimentConfig,
    dataset: Dataset,
    model: MaskedNet,
    activation: MaskActivation,
}

fn prepare(spec: &ExperimentSpec) -> Result<Prepared> {
    let config = ExperimentConfig::from_spec(spec).context("invalid experiment configuration")?;
    let unused = spec.unused_keys();
    if !unused.is_empty() {
        tracing::warn!(keys = ?unused, "experiment keys were never read");
    }
    let dataset = load_dataset(&config.dataset, config.seed)?;
    let activation: MaskActivation = config.mask.activation.parse()?;
    let options = MaskOptions {
        activation,
        sampling: config.mask.sampling,
        initial_value: config.mask.initial_value,
    };
    let model = MaskedNet::new(
        &config.model,
        dataset.input_shape,
        dataset.n_classes,
        &options,
        &Device::Cpu,
    )?;
    let stats = model.stats()?;
    tracing::info!(
        model = model.name(),
        dataset = %dataset.name,
        total_params = stats.total_params,
        prunable_params = stats.prunable_params,
        seed = config.seed,
        "experiment ready"
    );
    Ok(Prepared {
        config,
        dataset,
        model,
        activation,
    })
}

/// Prune, optionally reset around the pruned masks, then train.
pub fn pruning(spec: &mut ExperimentSpec, ctx: &RunContext) -> Result<()> {
    let Prepared {
        config,
        dataset,
        model,
        ..
    } = prepare(spec)?;
    let (_, outcome) = PhaseController::new(&config, &dataset, &ctx.cancel).run(model)?;

    spec.set("ACC", outcome.best_accuracy());
    if let Some(loss) = outcome.final_valid_loss() {
        spec.set("VALID_LOSS", loss);
    }
    spec.set("FINAL_DENSITY", outcome.final_density);
    if let Some(n) = outcome.preserved_masks {
        spec.set("PRESERVED_MASKS", n as u64);
    }
    Ok(())
}

/// Learn masks from a (possibly loaded) model, report against a reference
/// each epoch, then freeze and save the pruned model.
///
/// The frozen model is saved under the `save_model` entry for epoch
/// `num_epochs`, one past the last training epoch.
pub fn mask_learning(spec: &mut ExperimentSpec, ctx: &RunContext) -> Result<()> {
    let Prepared {
        config,
        dataset,
        model,
        activation,
    } = prepare(spec)?;
    let phases = &config.phases;

    if let Some(path) = &phases.load_model_before_pruning {
        load_checkpoint(&model, Path::new(path), None)?;
    }
    for m in model.masks() {
        m.fill(config.mask.initial_value)?;
    }
    let reference = match &phases.reference_checkpoint {
        Some(path) => Some(reference_masks(&model, Path::new(path))?),
        None => None,
    };

    let mut trainer = MaskedTrainer::new(model, &config)?;
    let steps_per_epoch = phases.effective_steps_per_epoch();
    let num_epochs = phases.num_epochs();
    let mut checkpointer = EpochCheckpointer::new(phases.save_model.clone(), phases.save_optim.clone());
    checkpointer.on_epoch_end(-1, &trainer.model, Some(trainer.kernel_optimizer()))?;
    trainer.set_global_step(phases.initial_epoch * steps_per_epoch);

    let mut stream = dataset.train_stream(config.seed);
    let mut best_accuracy = 0.0f64;
    let mut last: Option<Comparison> = None;
    for epoch in phases.initial_epoch..num_epochs {
        let (train_loss, train_accuracy) =
            trainer.train_epoch(&mut stream, steps_per_epoch, epoch, &ctx.cancel)?;
        let (valid_loss, valid_accuracy) = trainer.evaluate(&dataset)?;
        best_accuracy = best_accuracy.max(valid_accuracy);
        let density = trainer.model.density()?;
        tracing::info!(epoch, train_loss, train_accuracy, valid_loss, valid_accuracy, density, "epoch done");
        if let Some(reference) = &reference {
            let c = compare(reference, &logits(&trainer.model), activation, phases.force_sparsity)?;
            tracing::info!(
                epoch,
                f1 = c.f1,
                precision = c.precision,
                recall = c.recall,
                threshold = c.threshold,
                density = c.density,
                "compared to reference"
            );
            last = Some(c);
        }
        checkpointer.on_epoch_end(epoch as i64, &trainer.model, Some(trainer.kernel_optimizer()))?;
        spec.set("VALID_LOSS", valid_loss);
    }

    let mut model = trainer.model;
    freeze(&mut model, phases.freeze_threshold, last.as_ref(), phases.force_sparsity, activation)?;
    apply_pruning_masks(&model)?;
    checkpointer.on_epoch_end(num_epochs as i64, &model, None)?;

    spec.set("ACC", best_accuracy);
    spec.set("FINAL_DENSITY", model.density()?);
    if let Some(c) = last {
        spec.set("F1", c.f1);
        spec.set("THRESHOLD", c.threshold as f64);
    }
    Ok(())
}

fn logits(model: &MaskedNet) -> Vec<Tensor> {
    model.masks().iter().map(|m| m.logits().clone()).collect()
}

fn reference_masks(model: &MaskedNet, path: &Path) -> Result<Vec<Tensor>> {
    let reference = model.fresh()?;
    load_checkpoint(&reference, path, None)?;
    Ok(reference
        .masks()
        .iter()
        .map(|m| m.var().as_tensor().clone())
        .collect())
}

/// An explicit `freeze_threshold` applies to raw logits; otherwise the masks
/// freeze on activated scores at the comparison threshold, or at the
/// `force_sparsity` quantile, or at logit `0`.
fn freeze(
    model: &mut MaskedNet,
    freeze_threshold: Option<f64>,
    comparison: Option<&Comparison>,
    force_sparsity: Option<f64>,
    activation: MaskActivation,
) -> Result<()> {
    let score_threshold = match (freeze_threshold, comparison, force_sparsity) {
        (Some(_), _, _) => None,
        (None, Some(c), _) => Some(c.threshold),
        (None, None, Some(s)) => {
            let scores = candidate_scores(&logits(model), activation)?;
            let labels = vec![true; scores.len()];
            Some(compare_scores(&labels, &scores, Some(s))?.threshold)
        }
        (None, None, None) => None,
    };
    for layer in model.prunables_mut() {
        let mask = layer.mask_mut();
        match score_threshold {
            Some(t) => mask.freeze_by_score(t)?,
            None => mask.freeze(freeze_threshold.unwrap_or(0.0))?,
        }
    }
    tracing::info!(density = model.density()?, "masks frozen");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ExperimentSpec {
        ExperimentSpec::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    const SMALL: &str = "dataset: test\nmodel_config: {layer_sizes: [6]}\n\
        dataset_config: {image_shape: [2, 2, 1], train_batch_size: 2, valid_batch_size: 2}\n";

    #[test]
    fn pruning_records_results() {
        let mut s = spec(&format!(
            "{SMALL}steps: 2\npruning: magnitude\npruning_config: {{sparsity: 0.25}}\n"
        ));
        pruning(&mut s, &RunContext::default()).unwrap();
        assert!(s.peek("ACC").is_some());
        let density = s.peek("FINAL_DENSITY").and_then(|v| v.as_f64()).unwrap();
        assert!((density - 0.75).abs() < 0.05);
    }

    #[test]
    fn mask_learning_freezes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pruned.safetensors");
        let mut s = spec(&format!(
            "{SMALL}steps: 2\nforce_sparsity: 0.5\nsave_model: {{1: {}}}\n",
            out.display()
        ));
        mask_learning(&mut s, &RunContext::default()).unwrap();
        assert!(out.exists());
        let density = s.peek("FINAL_DENSITY").and_then(|v| v.as_f64()).unwrap();
        assert!(density > 0.0 && density <= 1.0);
    }

    #[test]
    fn builtin_modules_are_named() {
        let names: Vec<_> = builtin_modules().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["pruning", "mask_learning"]);
    }
}
