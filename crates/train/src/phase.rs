//! Checkpoint-driven phase controller.
//!
//! Stages run strictly in order:
//!
//! ```text
//! LoadBeforePruning? → ApplyPruningMasks → LoadAfterPruning? → LoadOptimizerState? → Train
//! ```
//!
//! `LoadAfterPruning` resets kernels and biases (from a checkpoint, or to a
//! fresh initialisation for `random`) while every mask tensor decided by
//! `ApplyPruningMasks` survives untouched.

use std::path::Path;

use anyhow::{bail, Result};

use trune_common::{CancelToken, Dataset, ExperimentConfig};
use trune_core::MaskedNet;

use crate::checkpoint::{load_checkpoint, reset_keeping_masks, EpochCheckpointer};
use crate::pruning::{apply_pruning_masks, set_pruning_masks, PruningContext, PruningMethod};
use crate::trainer::{EpochMetrics, MaskedTrainer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Ready,
    LoadBeforePruning,
    ApplyPruningMasks,
    LoadAfterPruning,
    LoadOptimizerState,
    Train,
    Done,
}

/// What a finished run reports back to its experiment record.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub epochs: Vec<EpochMetrics>,
    /// Mask tensors preserved by `LoadAfterPruning`, when it ran.
    pub preserved_masks: Option<usize>,
    pub final_density: f64,
}

impl PhaseOutcome {
    pub fn best_accuracy(&self) -> f64 {
        self.epochs.iter().map(|e| e.valid_accuracy).fold(0.0, f64::max)
    }

    pub fn final_valid_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.valid_loss)
    }
}

pub struct PhaseController<'a> {
    config: &'a ExperimentConfig,
    dataset: &'a Dataset,
    cancel: &'a CancelToken,
    stage: Stage,
}

impl<'a> PhaseController<'a> {
    pub fn new(config: &'a ExperimentConfig, dataset: &'a Dataset, cancel: &'a CancelToken) -> Self {
        Self {
            config,
            dataset,
            cancel,
            stage: Stage::Ready,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, next: Stage) -> Result<()> {
        if next <= self.stage {
            bail!("phase {next:?} cannot follow {:?}", self.stage);
        }
        tracing::debug!(stage = ?next, "entering phase");
        self.stage = next;
        Ok(())
    }

    /// Drive `model` through every stage and return it trained.
    pub fn run(&mut self, model: MaskedNet) -> Result<(MaskedNet, PhaseOutcome)> {
        let phases = &self.config.phases;
        let mut outcome = PhaseOutcome::default();
        // Parse before touching any checkpoint so a bad method fails fast.
        let method = PruningMethod::from_config(&phases.pruning, &phases.pruning_config)?;

        if let Some(path) = &phases.load_model_before_pruning {
            self.enter(Stage::LoadBeforePruning)?;
            let report = load_checkpoint(&model, Path::new(path), None)?;
            tracing::info!(path = %path, loaded = report.loaded, "loaded model before pruning");
        }

        self.enter(Stage::ApplyPruningMasks)?;
        let ctx = PruningContext {
            experiment: self.config,
            dataset: self.dataset,
            cancel: self.cancel,
        };
        let model = set_pruning_masks(model, &method, &ctx)?;

        if let Some(source) = &phases.load_model_after_pruning {
            self.enter(Stage::LoadAfterPruning)?;
            let ckp = (source != "random").then(|| Path::new(source.as_str()));
            let preserved = reset_keeping_masks(&model, ckp)?;
            tracing::info!(source = %source, preserved, "reset weights after pruning");
            outcome.preserved_masks = Some(preserved);
        }

        let mut trainer = MaskedTrainer::new(model, self.config)?;
        if let Some(path) = &phases.load_optimizer {
            self.enter(Stage::LoadOptimizerState)?;
            let restored = trainer.kernel_optimizer_mut().load(Path::new(path))?;
            tracing::info!(path = %path, restored, "loaded optimizer state");
        }

        self.enter(Stage::Train)?;
        apply_pruning_masks(&trainer.model)?;
        outcome.epochs = self.train(&mut trainer)?;
        outcome.final_density = trainer.model.density()?;
        self.enter(Stage::Done)?;
        tracing::info!(
            density = outcome.final_density,
            best_accuracy = outcome.best_accuracy(),
            "training finished"
        );
        Ok((trainer.model, outcome))
    }

    fn train(&self, trainer: &mut MaskedTrainer) -> Result<Vec<EpochMetrics>> {
        let phases = &self.config.phases;
        let steps_per_epoch = phases.effective_steps_per_epoch();
        let num_epochs = phases.num_epochs();
        let mut checkpointer =
            EpochCheckpointer::new(phases.save_model.clone(), phases.save_optim.clone());
        checkpointer.on_epoch_end(-1, &trainer.model, Some(trainer.kernel_optimizer()))?;

        trainer.set_global_step(phases.initial_epoch * steps_per_epoch);
        let mut stream = self.dataset.train_stream(self.config.seed);
        let mut history = Vec::new();
        for epoch in phases.initial_epoch..num_epochs {
            let (train_loss, train_accuracy) =
                trainer.train_epoch(&mut stream, steps_per_epoch, epoch, self.cancel)?;
            let (valid_loss, valid_accuracy) = trainer.evaluate(self.dataset)?;
            let density = trainer.model.density()?;
            tracing::info!(
                epoch,
                train_loss,
                train_accuracy,
                valid_loss,
                valid_accuracy,
                density,
                "epoch done"
            );
            checkpointer.on_epoch_end(epoch as i64, &trainer.model, Some(trainer.kernel_optimizer()))?;
            history.push(EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                valid_loss,
                valid_accuracy,
                density,
            });
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use trune_common::{load_dataset, ExperimentSpec};
    use trune_core::MaskOptions;

    fn config(yaml: &str) -> ExperimentConfig {
        let spec = ExperimentSpec::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap();
        ExperimentConfig::from_spec(&spec).unwrap()
    }

    fn build(cfg: &ExperimentConfig) -> (Dataset, MaskedNet) {
        let ds = load_dataset(&cfg.dataset, cfg.seed).unwrap();
        let net = MaskedNet::new(&cfg.model, ds.input_shape, ds.n_classes, &MaskOptions::default(), &Device::Cpu)
            .unwrap();
        (ds, net)
    }

    const SMALL: &str = "dataset: test\nmodel_config: {layer_sizes: [8]}\n\
        dataset_config: {image_shape: [2, 2, 1], train_batch_size: 2, valid_batch_size: 2}\n";

    #[test]
    fn runs_every_epoch_and_saves_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let init = dir.path().join("init.safetensors");
        let cfg = config(&format!(
            "{SMALL}steps: 6\nsteps_per_epoch: 2\npruning: magnitude\npruning_config: {{sparsity: 0.5}}\n\
             save_model: {{-1: {}}}\n",
            init.display()
        ));
        let (ds, net) = build(&cfg);
        let cancel = CancelToken::new();
        let mut ctl = PhaseController::new(&cfg, &ds, &cancel);
        let (model, outcome) = ctl.run(net).unwrap();
        assert_eq!(ctl.stage(), Stage::Done);
        assert_eq!(outcome.epochs.len(), 3);
        assert!(init.exists());
        assert!((outcome.final_density - 0.5).abs() < 0.05);
        assert!(model.masks().iter().all(|m| m.is_frozen()));
    }

    #[test]
    fn random_reset_preserves_every_mask() {
        let cfg = config(&format!(
            "{SMALL}steps: 2\npruning: random\npruning_config: {{sparsity: 0.3}}\nload_model_after_pruning: random\n"
        ));
        let (ds, net) = build(&cfg);
        let n_masks = net.masks().len();
        let cancel = CancelToken::new();
        let (_, outcome) = PhaseController::new(&cfg, &ds, &cancel).run(net).unwrap();
        assert_eq!(outcome.preserved_masks, Some(n_masks));
    }

    #[test]
    fn unknown_method_fails_before_training() {
        let cfg = config(&format!("{SMALL}steps: 2\npruning: snip\n"));
        let (ds, net) = build(&cfg);
        let cancel = CancelToken::new();
        let mut ctl = PhaseController::new(&cfg, &ds, &cancel);
        assert!(ctl.run(net).is_err());
        assert_eq!(ctl.stage(), Stage::Ready);
    }

    #[test]
    fn cancel_aborts_training() {
        let cfg = config(&format!("{SMALL}steps: 2\n"));
        let (ds, net) = build(&cfg);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = PhaseController::new(&cfg, &ds, &cancel).run(net).err().unwrap();
        assert!(err.downcast_ref::<trune_common::Cancelled>().is_some());
    }
}
