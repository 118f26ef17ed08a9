//! Gradient-applying capabilities: momentum SGD and loss scaling.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor, Var};
use trune_common::OptimizerConfig;

// ── MomentumSgd ─────────────────────────────────────────────────────────────

/// SGD with (optionally Nesterov) momentum over a fixed, named parameter list.
///
/// `v ← μ·v − lr·g`, then `w ← w + v` (or `w ← w + μ·v − lr·g` with Nesterov).
pub struct MomentumSgd {
    params: Vec<(String, Var)>,
    velocity: Vec<Option<Tensor>>,
    lr: f64,
    momentum: f64,
    nesterov: bool,
    iterations: usize,
}

impl MomentumSgd {
    pub fn new(params: Vec<(String, Var)>, config: &OptimizerConfig) -> Self {
        let velocity = vec![None; params.len()];
        Self {
            params,
            velocity,
            lr: config.learning_rate,
            momentum: config.momentum,
            nesterov: config.nesterov,
            iterations: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Apply one update; `grads[i]` belongs to the i-th parameter.
    pub fn apply(&mut self, grads: &[Tensor]) -> Result<()> {
        if grads.len() != self.params.len() {
            bail!(
                "optimizer holds {} parameters but received {} gradients",
                self.params.len(),
                grads.len()
            );
        }
        for (((_, var), grad), velocity) in
            self.params.iter().zip(grads).zip(self.velocity.iter_mut())
        {
            let step = grad.affine(-self.lr, 0.0)?;
            let v = match velocity.take() {
                Some(prev) => (prev.affine(self.momentum, 0.0)? + &step)?,
                None => step.clone(),
            };
            let delta = if self.nesterov {
                (v.affine(self.momentum, 0.0)? + &step)?
            } else {
                v.clone()
            };
            var.set(&(var.as_tensor() + delta)?)?;
            *velocity = Some(v);
        }
        self.iterations += 1;
        Ok(())
    }

    /// Save momentum buffers as `<param>.momentum` tensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tensors = HashMap::new();
        for ((name, var), v) in self.params.iter().zip(&self.velocity) {
            let v = match v {
                Some(v) => v.clone(),
                None => var.as_tensor().zeros_like()?,
            };
            tensors.insert(format!("{name}.momentum"), v);
        }
        let iterations = Tensor::new(&[self.iterations as f32], &candle_core::Device::Cpu)?;
        tensors.insert("iterations".to_string(), iterations);
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("save optimizer state to {}", path.display()))?;
        Ok(())
    }

    /// Restore momentum buffers by name; returns how many were restored.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let device = match self.params.first() {
            Some((_, v)) => v.device().clone(),
            None => candle_core::Device::Cpu,
        };
        let tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("load optimizer state from {}", path.display()))?;
        let mut restored = 0;
        for ((name, var), v) in self.params.iter().zip(self.velocity.iter_mut()) {
            match tensors.get(&format!("{name}.momentum")) {
                Some(t) if t.dims() == var.dims() => {
                    *v = Some(t.to_dtype(DType::F32)?);
                    restored += 1;
                }
                Some(t) => tracing::warn!(
                    param = %name,
                    ours = ?var.dims(),
                    theirs = ?t.dims(),
                    "optimizer state shape mismatch, skipping"
                ),
                None => tracing::warn!(param = %name, "no optimizer state found"),
            }
        }
        if let Some(it) = tensors.get("iterations") {
            self.iterations = it.flatten_all()?.to_vec1::<f32>()?.first().copied().unwrap_or(0.0) as usize;
        }
        Ok(restored)
    }
}

// ── Loss scaling ────────────────────────────────────────────────────────────

const GROWTH_INTERVAL: usize = 2000;
const INITIAL_DYNAMIC_SCALE: f64 = 32768.0;

/// Multiplies the loss before backward and divides the gradients after.
///
/// Dynamic scaling halves the scale whenever a gradient is non-finite (the
/// step is then skipped) and doubles it after [`GROWTH_INTERVAL`] finite steps.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    dynamic: bool,
    good_steps: usize,
}

impl LossScaler {
    pub fn fixed(scale: f64) -> Self {
        Self {
            scale,
            dynamic: false,
            good_steps: 0,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            scale: INITIAL_DYNAMIC_SCALE,
            dynamic: true,
            good_steps: 0,
        }
    }

    /// `16` → dynamic scaling; anything else → unit scale.
    pub fn for_precision(precision: u32) -> Self {
        if precision == 16 {
            Self::dynamic()
        } else {
            Self::fixed(1.0)
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> candle_core::Result<Tensor> {
        loss.affine(self.scale, 0.0)
    }

    /// Unscale gradients. `None` means the step must be skipped.
    pub fn unscale(&mut self, grads: Vec<Tensor>) -> Result<Option<Vec<Tensor>>> {
        let inv = 1.0 / self.scale;
        let grads = grads
            .into_iter()
            .map(|g| g.affine(inv, 0.0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        if !self.dynamic {
            return Ok(Some(grads));
        }
        let mut finite = true;
        for g in &grads {
            let s = g.abs()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            if !s.is_finite() {
                finite = false;
                break;
            }
        }
        if finite {
            self.good_steps += 1;
            if self.good_steps >= GROWTH_INTERVAL {
                self.scale *= 2.0;
                self.good_steps = 0;
            }
            Ok(Some(grads))
        } else {
            self.scale = (self.scale / 2.0).max(1.0);
            self.good_steps = 0;
            tracing::debug!(scale = self.scale, "non-finite gradients, skipping step");
            Ok(None)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(momentum: f64, nesterov: bool) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.5,
            momentum,
            nesterov,
            ..Default::default()
        }
    }

    fn param(v: f32) -> (String, Var) {
        ("w".to_string(), Var::new(&[v], &Device::Cpu).unwrap())
    }

    fn grad(g: f32) -> Tensor {
        Tensor::new(&[g], &Device::Cpu).unwrap()
    }

    #[test]
    fn plain_momentum_accumulates_velocity() {
        let (name, w) = param(1.0);
        let mut opt = MomentumSgd::new(vec![(name, w.clone())], &config(0.9, false));
        opt.apply(&[grad(1.0)]).unwrap(); // v = -0.5
        opt.apply(&[grad(1.0)]).unwrap(); // v = -0.45 - 0.5 = -0.95
        let got = w.to_vec1::<f32>().unwrap()[0];
        assert!((got - (1.0 - 0.5 - 0.95)).abs() < 1e-6);
        assert_eq!(opt.iterations(), 2);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let (name, w) = param(0.0);
        let mut opt = MomentumSgd::new(vec![(name, w.clone())], &config(0.5, true));
        opt.apply(&[grad(1.0)]).unwrap(); // v = -0.5, delta = -0.25 - 0.5
        assert!((w.to_vec1::<f32>().unwrap()[0] + 0.75).abs() < 1e-6);
    }

    #[test]
    fn gradient_count_must_match() {
        let mut opt = MomentumSgd::new(vec![param(0.0)], &config(0.0, false));
        assert!(opt.apply(&[]).is_err());
    }

    #[test]
    fn state_roundtrips_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optim.safetensors");
        let (name, w) = param(0.0);
        let mut opt = MomentumSgd::new(vec![(name.clone(), w)], &config(0.9, false));
        opt.apply(&[grad(2.0)]).unwrap();
        opt.save(&path).unwrap();

        let mut fresh = MomentumSgd::new(vec![param(0.0)], &config(0.9, false));
        assert_eq!(fresh.load(&path).unwrap(), 1);
        assert_eq!(fresh.iterations(), 1);
    }

    #[test]
    fn dynamic_scaler_skips_non_finite_steps() {
        let mut scaler = LossScaler::dynamic();
        let before = scaler.scale();
        let out = scaler.unscale(vec![grad(f32::INFINITY)]).unwrap();
        assert!(out.is_none());
        assert_eq!(scaler.scale(), before / 2.0);
        assert!(scaler.unscale(vec![grad(1.0)]).unwrap().is_some());
    }

    #[test]
    fn unit_scaler_is_transparent() {
        let mut scaler = LossScaler::for_precision(32);
        let out = scaler.unscale(vec![grad(3.0)]).unwrap().unwrap();
        assert_eq!(out[0].to_vec1::<f32>().unwrap(), vec![3.0]);
    }
}
