//! Masked training loop.
//!
//! One [`MaskedTrainer::step`] runs, in order: mask realisation (sampled
//! mode), forward, task + mask + model regularisation loss, loss-scaled
//! backward over `mask differentiables ++ kernel parameters`, the split of
//! that gradient list at the mask count, learning-rate-relative clipping of
//! mask gradients, the two optimiser updates, and logit clipping.

use std::io::IsTerminal;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::loss;
use indicatif::{ProgressBar, ProgressStyle};

use trune_common::{batch_to_tensors, CancelToken, ConfigError, Dataset, ExperimentConfig};
use trune_core::{MaskActivation, MaskedNet};

use crate::optim::{LossScaler, MomentumSgd};
use crate::scheduler::{LrScheduler, RegularizationSchedule};

// ── Mask regulariser ────────────────────────────────────────────────────────

/// Penalty summed over every learning mask's logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskRegularizer {
    None,
    /// `Σ |logits|`
    L1,
    /// `Σ |activation(logits)|`
    Activated,
    /// `Σ (logits + shift)`: a constant downward push on every logit.
    Shifted(f64),
}

impl MaskRegularizer {
    /// `shift` is used by the `shifted` variant (the logit clip bound).
    pub fn from_name(name: &str, shift: f64) -> Result<Self, ConfigError> {
        match name.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "l1" => Ok(Self::L1),
            "activated" => Ok(Self::Activated),
            "shifted" => Ok(Self::Shifted(shift)),
            _ => Err(ConfigError::UnknownRegularizer(name.to_string())),
        }
    }

    pub fn penalty(&self, logits: &Tensor, activation: MaskActivation) -> candle_core::Result<Tensor> {
        match self {
            Self::None => Tensor::zeros((), DType::F32, logits.device()),
            Self::L1 => logits.abs()?.sum_all(),
            Self::Activated => activation.apply(logits)?.abs()?.sum_all(),
            Self::Shifted(shift) => logits.affine(1.0, *shift)?.sum_all(),
        }
    }
}

/// Largest gradient magnitude allowed for a mask logit at learning rate `lr`.
///
/// `clip_bound(budget, lr) * lr == budget`, so a scheduled learning rate never
/// changes the maximum logit change per step.
pub fn clip_bound(budget: f64, lr: f64) -> f64 {
    budget / lr
}

// ── Config & metrics ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub clip: f64,
    pub grad_budget: f64,
    pub regularizer: MaskRegularizer,
    pub regularization: RegularizationSchedule,
    pub train_kernels: bool,
    pub precision: u32,
    /// Total steps, bounds cosine/linear learning-rate decay.
    pub total_steps: usize,
}

impl TrainerConfig {
    pub fn from_experiment(cfg: &ExperimentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            clip: cfg.mask.clip,
            grad_budget: cfg.mask.grad_budget,
            regularizer: MaskRegularizer::from_name(&cfg.mask.regularizer, cfg.mask.clip)?,
            regularization: RegularizationSchedule::new(cfg.mask.regularization.clone()),
            train_kernels: cfg.mask.train_kernels,
            precision: cfg.precision,
            total_steps: cfg.phases.steps,
        })
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    /// Task loss plus every regularisation term.
    pub full_loss: f32,
    pub accuracy: f32,
    pub max_gradient: f32,
    pub lr: f64,
    pub mask_lr: f64,
    /// The loss scaler rejected this step's gradients.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    pub density: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns the model, both optimisers, and all schedules.
pub struct MaskedTrainer {
    pub model: MaskedNet,
    kernel_optimizer: MomentumSgd,
    kernel_lr: LrScheduler,
    mask_optimizer: MomentumSgd,
    mask_lr: LrScheduler,
    /// Indices into `model.masks()` that are learning.
    learning: Vec<usize>,
    scaler: LossScaler,
    regularization_coef: f64,
    pub config: TrainerConfig,
    pub global_step: usize,
}

impl MaskedTrainer {
    /// Every mask that is not frozen enters the learning state.
    pub fn new(mut model: MaskedNet, experiment: &ExperimentConfig) -> Result<Self> {
        let config = TrainerConfig::from_experiment(experiment)?;

        let mut learning = Vec::new();
        for (i, layer) in model.prunables_mut().into_iter().enumerate() {
            if !layer.mask().is_frozen() {
                layer.mask_mut().start_learning()?;
                learning.push(i);
            }
        }
        let masks = model.masks();
        let mask_params = learning
            .iter()
            .flat_map(|&i| {
                let name = masks[i].name();
                masks[i]
                    .updatable()
                    .into_iter()
                    .enumerate()
                    .map(move |(j, v)| (format!("{name}.{j}"), v))
            })
            .collect();

        let kernel_optimizer = MomentumSgd::new(model.kernel_vars(), &experiment.optimizer);
        let mask_optimizer = MomentumSgd::new(mask_params, &experiment.mask.optimizer);
        let kernel_lr = LrScheduler::from_config(&experiment.optimizer, config.total_steps);
        let mask_lr = LrScheduler::from_config(&experiment.mask.optimizer, config.total_steps);

        tracing::info!(
            learning_masks = learning.len(),
            kernel_params = kernel_optimizer.len(),
            mask_params = mask_optimizer.len(),
            precision = config.precision,
            "trainer ready"
        );

        Ok(Self {
            model,
            kernel_optimizer,
            kernel_lr,
            mask_optimizer,
            mask_lr,
            learning,
            scaler: LossScaler::for_precision(config.precision),
            regularization_coef: config.regularization.coefficient(0),
            config,
            global_step: 0,
        })
    }

    pub fn kernel_optimizer(&self) -> &MomentumSgd {
        &self.kernel_optimizer
    }

    pub fn kernel_optimizer_mut(&mut self) -> &mut MomentumSgd {
        &mut self.kernel_optimizer
    }

    pub fn mask_learning_rate(&self) -> f64 {
        self.mask_lr.current_lr()
    }

    /// Position schedules at `step` (resuming from a later epoch).
    pub fn set_global_step(&mut self, step: usize) {
        self.global_step = step;
        self.kernel_lr.set_step(step);
        self.mask_lr.set_step(step);
    }

    /// Apply the regularisation coefficient scheduled for `epoch`.
    pub fn begin_epoch(&mut self, epoch: usize) {
        let coef = self.config.regularization.coefficient(epoch);
        if coef != self.regularization_coef {
            tracing::info!(epoch, coef, "mask regularization changed");
        }
        self.regularization_coef = coef;
    }

    fn mask_penalty(&self) -> candle_core::Result<Tensor> {
        let device = self.model.device();
        let mut total = Tensor::zeros((), DType::F32, device)?;
        if self.regularization_coef == 0.0 || self.config.regularizer == MaskRegularizer::None {
            return Ok(total);
        }
        let masks = self.model.masks();
        for &i in &self.learning {
            let m = masks[i];
            total = (total + self.config.regularizer.penalty(m.logits(), m.activation())?)?;
        }
        total.affine(self.regularization_coef, 0.0)
    }

    /// One optimisation step on a raw batch.
    pub fn step(&mut self, images: &[f32], labels: &[u32]) -> Result<StepMetrics> {
        let [h, w, c] = self.model.input_shape();
        let (x, y) = batch_to_tensors(images, labels, [c, h, w], self.model.device())?;

        let masks = self.model.masks();
        for &i in &self.learning {
            masks[i].realize()?;
        }

        let logits = self.model.forward(&x)?;
        let task_loss = loss::cross_entropy(&logits, &y)?;
        let full_loss = ((&task_loss + self.mask_penalty()?)? + self.model.l2_loss()?)?;

        // Gradients w.r.t. mask differentiables ++ kernel parameters, in that order.
        let mask_diff: Vec<Tensor> = self
            .learning
            .iter()
            .flat_map(|&i| masks[i].differentiable())
            .collect();
        let split = mask_diff.len();
        let params: Vec<Tensor> = mask_diff
            .into_iter()
            .chain(self.model.kernel_vars().into_iter().map(|(_, v)| v.as_tensor().clone()))
            .collect();
        let store = self.scaler.scale_loss(&full_loss)?.backward()?;
        let scaled = params
            .iter()
            .map(|p| match store.get(p) {
                Some(g) => Ok(g.clone()),
                None => p.zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let lr = self.kernel_lr.current_lr();
        let mask_lr = self.mask_lr.current_lr();
        let mut metrics = StepMetrics {
            step: self.global_step,
            loss: task_loss.to_scalar::<f32>()?,
            full_loss: full_loss.to_scalar::<f32>()?,
            accuracy: accuracy(&logits, &y)?,
            lr,
            mask_lr,
            ..Default::default()
        };

        let Some(grads) = self.scaler.unscale(scaled)? else {
            metrics.skipped = true;
            self.advance();
            return Ok(metrics);
        };
        metrics.max_gradient = max_abs(&grads)?;

        let (mask_grads, kernel_grads) = grads.split_at(split);

        let bound = clip_bound(self.config.grad_budget, mask_lr);
        let mask_grads = mask_grads
            .iter()
            .map(|g| g.clamp(-bound, bound))
            .collect::<candle_core::Result<Vec<_>>>()?;

        if self.config.train_kernels {
            self.kernel_optimizer.set_learning_rate(lr);
            self.kernel_optimizer.apply(kernel_grads)?;
        }

        if !self.mask_optimizer.is_empty() {
            let mut folded = Vec::with_capacity(self.mask_optimizer.len());
            let mut offset = 0;
            for &i in &self.learning {
                let n = masks[i].differentiable().len();
                folded.extend(masks[i].fold_gradients(&mask_grads[offset..offset + n])?);
                offset += n;
            }
            self.mask_optimizer.set_learning_rate(mask_lr);
            self.mask_optimizer.apply(&folded)?;
        }

        for &i in &self.learning {
            masks[i].clip(self.config.clip)?;
        }

        self.advance();
        Ok(metrics)
    }

    fn advance(&mut self) {
        self.kernel_lr.advance();
        self.mask_lr.advance();
        self.global_step += 1;
    }

    /// Run `steps` optimisation steps, polling `cancel` between them.
    pub fn train_epoch(
        &mut self,
        batches: &mut dyn Iterator<Item = (Vec<f32>, Vec<u32>)>,
        steps: usize,
        epoch: usize,
        cancel: &CancelToken,
    ) -> Result<(f64, f64)> {
        self.begin_epoch(epoch);
        let pb = progress_bar(steps, epoch);
        let (mut loss_sum, mut acc_sum, mut count) = (0.0f64, 0.0f64, 0usize);
        for _ in 0..steps {
            cancel.check()?;
            let Some((images, labels)) = batches.next() else {
                anyhow::bail!("training batch stream ended early");
            };
            let m = self.step(&images, &labels)?;
            if !m.skipped {
                loss_sum += m.loss as f64;
                acc_sum += m.accuracy as f64;
                count += 1;
            }
            pb.set_message(format!(
                "loss {:.4} full {:.4} acc {:.3} max_grad {:.2e}",
                m.loss, m.full_loss, m.accuracy, m.max_gradient
            ));
            pb.inc(1);
        }
        pb.finish_and_clear();
        let n = count.max(1) as f64;
        Ok((loss_sum / n, acc_sum / n))
    }

    /// Validation loss and accuracy over the whole split. No mask is touched.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<(f64, f64)> {
        evaluate(&self.model, dataset)
    }
}

/// Forward-only pass over the validation split, weighted by batch size.
pub fn evaluate(model: &MaskedNet, dataset: &Dataset) -> Result<(f64, f64)> {
    let [h, w, c] = model.input_shape();
    let (mut loss_sum, mut acc_sum, mut seen) = (0.0f64, 0.0f64, 0usize);
    for (images, labels) in dataset.valid_batches() {
        let n = labels.len();
        let (x, y) = batch_to_tensors(&images, &labels, [c, h, w], model.device())?;
        let logits = model.forward(&x)?.detach();
        loss_sum += loss::cross_entropy(&logits, &y)?.to_scalar::<f32>()? as f64 * n as f64;
        acc_sum += accuracy(&logits, &y)? as f64 * n as f64;
        seen += n;
    }
    if seen == 0 {
        return Ok((f64::MAX, 0.0));
    }
    Ok((loss_sum / seen as f64, acc_sum / seen as f64))
}

fn accuracy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<f32> {
    logits
        .argmax(1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

fn max_abs(grads: &[Tensor]) -> candle_core::Result<f32> {
    let mut max = 0.0f32;
    for g in grads {
        if g.elem_count() > 0 {
            max = max.max(g.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?);
        }
    }
    Ok(max)
}

fn progress_bar(steps: usize, epoch: usize) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(steps as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {prefix} {bar:40} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(format!("epoch {epoch}"));
    pb
}

impl FromStr for MaskRegularizer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s, 10.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn clip_bound_keeps_logit_budget_constant() {
        let budget = 0.1;
        for lr in [1.0, 10.0, 100.0] {
            assert!((clip_bound(budget, lr) * lr - budget).abs() < 1e-12);
        }
    }

    #[test]
    fn regularizer_penalties() {
        let t = Tensor::new(&[-2.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let id = MaskActivation::Identity;
        let v = |r: MaskRegularizer| r.penalty(&t, id).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(v(MaskRegularizer::None), 0.0);
        assert_eq!(v(MaskRegularizer::L1), 5.0);
        assert_eq!(v(MaskRegularizer::Activated), 5.0);
        assert_eq!(v(MaskRegularizer::Shifted(10.0)), 31.0);
    }

    #[test]
    fn unknown_regularizer_fails_fast() {
        assert!(matches!(
            MaskRegularizer::from_name("l2", 10.0),
            Err(ConfigError::UnknownRegularizer(_))
        ));
    }
}
