//! Per-kernel mask state machine.
//!
//! A [`Mask`] owns the mask variable stored in checkpoints under
//! `<layer>.kernel_mask`. What that variable means depends on the
//! [`MaskPolicy`]:
//!
//! * **Deterministic** — it holds the logits. The forward pass multiplies the
//!   kernel by `activation(logits)` and the logits receive gradients directly.
//! * **Sampled** — it holds the binary mask realised this step. The logits
//!   live in a separate `<layer>.kernel_mask_distribution` variable which is the
//!   only updatable tensor; gradients w.r.t. the realised mask are routed to it.
//!
//! Lifecycle: `Uninitialized → Learning → Frozen`. Frozen is terminal: the
//! mask variable holds a strict `{0, 1}` tensor, contributes no differentiable
//! or updatable tensors, and every further update is rejected.

use candle_core::{DType, Tensor, Var};

use crate::activation::MaskActivation;
use crate::error::{MaskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskState {
    Uninitialized,
    Learning,
    Frozen,
}

#[derive(Debug, Clone)]
pub enum MaskPolicy {
    Deterministic,
    Sampled { distribution: Var },
}

#[derive(Debug, Clone)]
pub struct Mask {
    layer: String,
    var: Var,
    policy: MaskPolicy,
    state: MaskState,
    activation: MaskActivation,
}

impl Mask {
    pub fn new(layer: &str, var: Var, policy: MaskPolicy, activation: MaskActivation) -> Self {
        Self {
            layer: layer.to_string(),
            var,
            policy,
            state: MaskState::Uninitialized,
            activation,
        }
    }

    /// Checkpoint name of the mask variable.
    pub fn name(&self) -> String {
        format!("{}.{}", self.layer, trune_common::MASK_KEYWORD)
    }

    pub fn state(&self) -> MaskState {
        self.state
    }

    pub fn policy(&self) -> &MaskPolicy {
        &self.policy
    }

    pub fn activation(&self) -> MaskActivation {
        self.activation
    }

    pub fn is_frozen(&self) -> bool {
        self.state == MaskState::Frozen
    }

    /// The stored mask variable (logits, realised mask, or frozen binary mask).
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// The continuous representation: the distribution in sampled mode,
    /// otherwise the mask variable itself.
    pub fn logits(&self) -> &Tensor {
        match &self.policy {
            MaskPolicy::Sampled { distribution } if !self.is_frozen() => distribution.as_tensor(),
            _ => self.var.as_tensor(),
        }
    }

    /// Enter the learning state. Fails once frozen.
    pub fn start_learning(&mut self) -> Result<()> {
        match self.state {
            MaskState::Frozen => Err(MaskError::Frozen { name: self.name() }),
            _ => {
                self.state = MaskState::Learning;
                Ok(())
            }
        }
    }

    /// Draw this step's binary mask from the distribution (sampled mode only).
    ///
    /// Each element is kept with probability `|activation(logits)|` and takes
    /// the sign of the activation: `+1`, `-1` or `0`.
    pub fn realize(&self) -> Result<()> {
        let MaskPolicy::Sampled { distribution } = &self.policy else {
            return Ok(());
        };
        if self.is_frozen() {
            return Ok(());
        }
        let probs = self.activation.apply(distribution.as_tensor())?.detach();
        let sign = probs.ge(0f64)?.to_dtype(DType::F32)?.affine(2.0, -1.0)?;
        let draw = Tensor::rand(0f32, 1f32, probs.shape(), probs.device())?;
        let keep = draw.lt(&probs.abs()?)?.to_dtype(DType::F32)?;
        self.var.set(&(&sign * &keep)?)?;
        Ok(())
    }

    /// The factor multiplied into the kernel during the forward pass.
    pub fn multiplier(&self) -> Result<Tensor> {
        Ok(match (&self.policy, self.state) {
            (_, MaskState::Frozen) => self.var.as_tensor().detach(),
            (MaskPolicy::Deterministic, _) => self.activation.apply(self.var.as_tensor())?,
            (MaskPolicy::Sampled { .. }, _) => self.var.as_tensor().clone(),
        })
    }

    /// Tensors whose gradients the training loop collects, in a fixed order.
    pub fn differentiable(&self) -> Vec<Tensor> {
        match (&self.policy, self.state) {
            (_, MaskState::Frozen) => Vec::new(),
            (MaskPolicy::Deterministic, _) => vec![self.var.as_tensor().clone()],
            (MaskPolicy::Sampled { distribution }, _) => {
                vec![self.var.as_tensor().clone(), distribution.as_tensor().clone()]
            }
        }
    }

    /// Variables the mask optimiser is allowed to touch.
    pub fn updatable(&self) -> Vec<Var> {
        match (&self.policy, self.state) {
            (_, MaskState::Frozen) => Vec::new(),
            (MaskPolicy::Deterministic, _) => vec![self.var.clone()],
            (MaskPolicy::Sampled { distribution }, _) => vec![distribution.clone()],
        }
    }

    /// Map gradients aligned with [`differentiable`](Self::differentiable) onto
    /// [`updatable`](Self::updatable).
    pub fn fold_gradients(&self, grads: &[Tensor]) -> Result<Vec<Tensor>> {
        if self.is_frozen() {
            return Err(MaskError::Frozen { name: self.name() });
        }
        match (&self.policy, grads) {
            (MaskPolicy::Deterministic, [g]) => Ok(vec![g.clone()]),
            (MaskPolicy::Sampled { .. }, [realized, direct]) => Ok(vec![(realized + direct)?]),
            _ => Err(MaskError::LengthMismatch {
                reference: self.differentiable().len(),
                candidate: grads.len(),
            }),
        }
    }

    /// Set every logit to `value`.
    pub fn fill(&self, value: f64) -> Result<()> {
        if self.is_frozen() {
            return Err(MaskError::Frozen { name: self.name() });
        }
        for var in self.updatable() {
            var.set(&var.as_tensor().ones_like()?.affine(value, 0.0)?)?;
        }
        Ok(())
    }

    /// Clamp the logits to `[-bound, bound]`.
    pub fn clip(&self, bound: f64) -> Result<()> {
        if self.is_frozen() {
            return Ok(());
        }
        for var in self.updatable() {
            let clipped = var.as_tensor().clamp(-bound, bound)?;
            var.set(&clipped)?;
        }
        Ok(())
    }

    /// Binarise: `1` where `logits > threshold`, else `0`. Terminal.
    pub fn freeze(&mut self, threshold: f64) -> Result<()> {
        if self.is_frozen() {
            return Err(MaskError::Frozen { name: self.name() });
        }
        let binary = self.logits().gt(threshold)?.to_dtype(DType::F32)?;
        self.finalize(&binary)
    }

    /// Binarise on the activated score: `1` where `|activation(logits)| >= threshold`.
    pub fn freeze_by_score(&mut self, threshold: f32) -> Result<()> {
        if self.is_frozen() {
            return Err(MaskError::Frozen { name: self.name() });
        }
        let score = self.activation.apply(self.logits())?.abs()?;
        let binary = score.ge(threshold as f64)?.to_dtype(DType::F32)?;
        self.finalize(&binary)
    }

    /// Overwrite with an externally decided mask; the mask becomes frozen.
    pub fn assign(&mut self, mask: &Tensor) -> Result<()> {
        if mask.dims() != self.var.dims() {
            return Err(MaskError::ShapeMismatch {
                name: self.name(),
                expected: self.var.dims().to_vec(),
                found: mask.dims().to_vec(),
            });
        }
        let mask = mask.to_dtype(DType::F32)?;
        self.finalize(&mask)
    }

    fn finalize(&mut self, binary: &Tensor) -> Result<()> {
        self.var.set(binary)?;
        self.state = MaskState::Frozen;
        Ok(())
    }

    /// `(Σ|multiplier|, element count)`, for density across several masks.
    pub fn mass(&self) -> Result<(f64, usize)> {
        let m = self.multiplier()?.detach();
        let sum = m.abs()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        Ok((sum, m.elem_count()))
    }

    /// Mean absolute multiplier: the surviving-weight fraction for binary masks.
    pub fn density(&self) -> Result<f64> {
        let (sum, n) = self.mass()?;
        Ok(if n == 0 { 0.0 } else { sum / n as f64 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn deterministic(values: &[f32]) -> Mask {
        let var = Var::new(values, &Device::Cpu).unwrap();
        Mask::new("dense_0", var, MaskPolicy::Deterministic, MaskActivation::Sigmoid)
    }

    fn sampled(logits: &[f32]) -> Mask {
        let dev = Device::Cpu;
        let var = Var::zeros(logits.len(), DType::F32, &dev).unwrap();
        let distribution = Var::new(logits, &dev).unwrap();
        Mask::new("dense_0", var, MaskPolicy::Sampled { distribution }, MaskActivation::Tanh)
    }

    #[test]
    fn freeze_thresholds_logits() {
        let mut m = deterministic(&[-2.0, 0.5, 3.0, 0.0]);
        m.freeze(0.0).unwrap();
        assert_eq!(m.state(), MaskState::Frozen);
        assert_eq!(m.var().to_vec1::<f32>().unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(m.multiplier().unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
        assert!((m.density().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn frozen_mask_is_terminal() {
        let mut m = deterministic(&[1.0, -1.0]);
        m.freeze(0.0).unwrap();
        assert!(matches!(m.freeze(0.0), Err(MaskError::Frozen { .. })));
        assert!(matches!(m.start_learning(), Err(MaskError::Frozen { .. })));
        assert!(m.differentiable().is_empty());
        assert!(m.updatable().is_empty());
        m.clip(0.1).unwrap();
        assert_eq!(m.var().to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn assign_rejects_wrong_shape() {
        let mut m = deterministic(&[1.0, 1.0, 1.0]);
        let bad = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(m.assign(&bad), Err(MaskError::ShapeMismatch { .. })));
        assert_eq!(m.state(), MaskState::Uninitialized);
    }

    #[test]
    fn clip_bounds_logits() {
        let m = deterministic(&[-30.0, 2.0, 30.0]);
        m.clip(10.0).unwrap();
        assert_eq!(m.var().to_vec1::<f32>().unwrap(), vec![-10.0, 2.0, 10.0]);
    }

    #[test]
    fn sampling_follows_saturated_probabilities() {
        // tanh(±20) is ±1 in f32, so every draw is kept with the activation's sign.
        let m = sampled(&[20.0, -20.0, 20.0]);
        m.realize().unwrap();
        assert_eq!(m.var().to_vec1::<f32>().unwrap(), vec![1.0, -1.0, 1.0]);

        let m = sampled(&[0.0, 0.0]);
        m.realize().unwrap();
        assert_eq!(m.var().to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn sampled_routes_both_gradients_to_the_distribution() {
        let m = sampled(&[0.3, -0.3]);
        assert_eq!(m.differentiable().len(), 2);
        assert_eq!(m.updatable().len(), 1);
        let dev = Device::Cpu;
        let g1 = Tensor::new(&[1.0f32, 2.0], &dev).unwrap();
        let g2 = Tensor::new(&[0.5f32, 0.5], &dev).unwrap();
        let folded = m.fold_gradients(&[g1, g2]).unwrap();
        assert_eq!(folded[0].to_vec1::<f32>().unwrap(), vec![1.5, 2.5]);
    }
}
