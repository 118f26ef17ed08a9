//! Learning-rate and mask-regularisation schedules.

use std::collections::BTreeMap;

use trune_common::OptimizerConfig;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Shape of the learning rate after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Constant,
    Cosine,
    Linear,
}

impl LrDecay {
    /// `none` is the constant schedule; names are validated by `OptimizerConfig`.
    pub fn parse(name: &str) -> Self {
        match name {
            "cosine" => Self::Cosine,
            "linear" => Self::Linear,
            _ => Self::Constant,
        }
    }

    /// Multiplier on `peak - floor` after a fraction `t ∈ [0, 1]` of the decay.
    fn factor(self, t: f64) -> f64 {
        match self {
            Self::Constant => 1.0,
            Self::Linear => 1.0 - t,
            Self::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * t).cos()),
        }
    }
}

#[derive(Clone, Debug)]
enum Shape {
    /// `values[i]` applies while `step < boundaries[i]`; the last value after.
    Piecewise { boundaries: Vec<usize>, values: Vec<f64> },
    /// Linear ramp to `peak` over `warmup` steps, then `decay` down to
    /// `floor` at step `total`.
    Warmup {
        peak: f64,
        floor: f64,
        warmup: usize,
        total: usize,
        decay: LrDecay,
    },
}

/// Step-indexed learning rate for one optimiser.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    shape: Shape,
}

impl LrScheduler {
    /// Piecewise schedule when `boundaries` is set, warmup + decay otherwise;
    /// `total_steps` is where cosine/linear decay reaches `lr_min`.
    pub fn from_config(config: &OptimizerConfig, total_steps: usize) -> Self {
        let shape = if config.boundaries.is_empty() {
            Shape::Warmup {
                peak: config.learning_rate,
                floor: config.lr_min,
                warmup: config.warmup_steps,
                total: total_steps,
                decay: LrDecay::parse(&config.decay),
            }
        } else {
            Shape::Piecewise {
                boundaries: config.boundaries.clone(),
                values: config.values.clone(),
            }
        };
        Self { step: 0, shape }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        match &self.shape {
            Shape::Piecewise { boundaries, values } => {
                let i = boundaries.partition_point(|&b| b <= step);
                values.get(i).or(values.last()).copied().unwrap_or(0.0)
            }
            &Shape::Warmup {
                peak,
                floor,
                warmup,
                total,
                decay,
            } => {
                if step < warmup {
                    return peak * (step + 1) as f64 / warmup as f64;
                }
                let span = total.saturating_sub(warmup);
                let t = if span == 0 {
                    0.0
                } else {
                    ((step - warmup) as f64 / span as f64).min(1.0)
                };
                floor + (peak - floor) * decay.factor(t)
            }
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Jump to `step`, e.g. when resuming from `initial_epoch`.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

// ── Regularisation schedule ─────────────────────────────────────────────────

/// Step function over epochs: the coefficient of the largest listed epoch
/// `<=` the current one; `0` before the first listed epoch.
#[derive(Clone, Debug, Default)]
pub struct RegularizationSchedule {
    points: BTreeMap<usize, f64>,
}

impl RegularizationSchedule {
    pub fn new(points: BTreeMap<usize, f64>) -> Self {
        Self { points }
    }

    pub fn constant(coef: f64) -> Self {
        Self::new(BTreeMap::from([(0, coef)]))
    }

    pub fn coefficient(&self, epoch: usize) -> f64 {
        self.points
            .range(..=epoch)
            .next_back()
            .map(|(_, &c)| c)
            .unwrap_or(0.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer(yaml: &str) -> OptimizerConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn default_config_is_constant() {
        let mut sched = LrScheduler::from_config(&OptimizerConfig::default(), 100);
        assert_eq!(sched.current_lr(), 0.1);
        sched.set_step(99);
        assert_eq!(sched.current_lr(), 0.1);
        assert_eq!(sched.lr_at(10_000), 0.1);
    }

    #[test]
    fn piecewise_from_boundaries() {
        let config = optimizer("learning_rate: 7.0\nboundaries: [4000, 12000]\nvalues: [1000.0, 100.0, 10.0]\n");
        let sched = LrScheduler::from_config(&config, 0);
        assert_eq!(sched.lr_at(0), 1000.0);
        assert_eq!(sched.lr_at(3999), 1000.0);
        assert_eq!(sched.lr_at(4000), 100.0);
        assert_eq!(sched.lr_at(11999), 100.0);
        assert_eq!(sched.lr_at(12000), 10.0);
        assert_eq!(sched.lr_at(50000), 10.0);
    }

    #[test]
    fn warmup_then_linear_reaches_floor_at_total() {
        let config = optimizer("learning_rate: 1.0\nlr_min: 0.2\nwarmup_steps: 4\ndecay: linear\n");
        let sched = LrScheduler::from_config(&config, 14);
        assert_eq!(sched.lr_at(0), 0.25);
        assert_eq!(sched.lr_at(3), 1.0);
        assert_eq!(sched.lr_at(4), 1.0);
        assert!((sched.lr_at(9) - 0.6).abs() < 1e-12);
        assert!((sched.lr_at(14) - 0.2).abs() < 1e-12);
        assert!((sched.lr_at(100) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn cosine_is_halfway_at_midpoint_and_resumes_by_step() {
        let config = optimizer("learning_rate: 2.0\ndecay: cosine\n");
        let mut sched = LrScheduler::from_config(&config, 10);
        assert_eq!(sched.current_lr(), 2.0);
        sched.set_step(5);
        assert!((sched.current_lr() - 1.0).abs() < 1e-12);
        sched.advance();
        assert_eq!(sched.step(), 6);
        assert!(sched.current_lr() < 1.0);
    }

    #[test]
    fn regularization_uses_largest_epoch_not_after() {
        let sched = RegularizationSchedule::new(BTreeMap::from([(2, 1e-7), (5, 3e-7)]));
        assert_eq!(sched.coefficient(0), 0.0);
        assert_eq!(sched.coefficient(2), 1e-7);
        assert_eq!(sched.coefficient(4), 1e-7);
        assert_eq!(sched.coefficient(5), 3e-7);
        assert_eq!(sched.coefficient(99), 3e-7);
        assert_eq!(RegularizationSchedule::constant(0.5).coefficient(7), 0.5);
    }
}
