//! # trune-train — Masked Training and Phase Control
//!
//! Everything that moves weights or masks during an experiment:
//!
//! * **[`MaskedTrainer`]** — owns the model, the kernel and mask optimisers,
//!   and their schedules. One call to [`MaskedTrainer::step`] realises
//!   sampled masks, runs forward and backward over
//!   `mask differentiables ++ kernels`, clips mask gradients to
//!   `budget / lr`, applies both optimisers, and clips the logits.
//! * **[`MomentumSgd`]** / **[`LossScaler`]** — SGD with (Nesterov)
//!   momentum and static or dynamic loss scaling.
//! * **[`LrScheduler`]** — piecewise constant, or warmup → cosine / linear /
//!   constant. **[`RegularizationSchedule`]** — epoch-keyed step function.
//! * **[`PruningMethod`]** — `none`, `keep`, `magnitude`, `random`, `learned`.
//! * **[`PhaseController`]** — load → prune → mask-preserving reset →
//!   optimiser restore → train, checkpointing every listed epoch.
//! * **[`modules`]** — the `pruning` and `mask_learning` entry points.

pub mod checkpoint;
pub mod modules;
pub mod optim;
pub mod phase;
pub mod pruning;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    load_checkpoint, reset_keeping_masks, reset_weights_to_checkpoint, save_checkpoint,
    EpochCheckpointer, LoadReport,
};
pub use modules::{builtin_modules, ModuleFn};
pub use optim::{LossScaler, MomentumSgd};
pub use phase::{PhaseController, PhaseOutcome, Stage};
pub use pruning::{apply_pruning_masks, set_pruning_masks, PruningContext, PruningMethod, Scope};
pub use scheduler::{LrDecay, LrScheduler, RegularizationSchedule};
pub use trainer::{clip_bound, EpochMetrics, MaskRegularizer, MaskedTrainer, StepMetrics, TrainerConfig};
