//! # trune-core — Masks and Prunable Networks
//!
//! Everything that touches a mask tensor lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`activation`] | `MaskActivation` (identity / sigmoid / tanh) |
//! | [`mask`] | `Mask` state machine, `MaskPolicy` (deterministic / sampled) |
//! | [`layer`] | `Prunable` capability, `MaskedDense`, `MaskedConv2d` |
//! | [`model`] | `MaskedNet` (LeNet, LeNet-conv, VGG) built from a `ModelConfig` |
//! | [`compare`] | precision/recall threshold selection against a reference mask |
//!
//! ## Design principles
//!
//! 1. **Explicit capability.** Layers are pruned through the [`Prunable`]
//!    trait, never by probing names or attributes.
//! 2. **Topology in the type.** Which tensors receive gradients and which ones
//!    the mask optimiser may update is declared by [`MaskPolicy`].
//! 3. **Stable names.** Every tensor has a checkpoint name; mask tensors all
//!    contain [`trune_common::MASK_KEYWORD`].

pub mod activation;
pub mod compare;
pub mod error;
pub mod layer;
pub mod mask;
pub mod model;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use activation::MaskActivation;
pub use compare::{compare, compare_scores, precision_recall_curve, Comparison, PrCurve};
pub use error::MaskError;
pub use layer::{MaskedConv2d, MaskedDense, Prunable};
pub use mask::{Mask, MaskPolicy, MaskState};
pub use model::{MaskOptions, MaskedNet, NetStats};
