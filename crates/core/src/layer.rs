//! Prunable layers.
//!
//! [`Prunable`] is the capability the training loop and pruning methods work
//! against; the concrete layers only differ in how the masked kernel is used
//! in the forward pass.

use candle_core::{Tensor, Var};

use crate::error::Result;
use crate::mask::Mask;

/// A layer with one kernel and one mask of the same shape.
pub trait Prunable {
    fn name(&self) -> &str;
    fn kernel(&self) -> &Var;
    fn mask(&self) -> &Mask;
    fn mask_mut(&mut self) -> &mut Mask;

    fn mask_logits(&self) -> &Tensor {
        self.mask().logits()
    }

    /// Replace the mask with a decided one. Shape must match the kernel exactly.
    fn set_mask(&mut self, mask: &Tensor) -> Result<()> {
        self.mask_mut().assign(mask)
    }

    /// Kernel with the current mask multiplier applied.
    fn masked_kernel(&self) -> Result<Tensor> {
        Ok(self.kernel().as_tensor().broadcast_mul(&self.mask().multiplier()?)?)
    }

    /// Bake the mask into the stored kernel so pruned weights are exactly zero.
    fn apply_mask(&self) -> Result<()> {
        let masked = self.masked_kernel()?.detach();
        self.kernel().set(&masked)?;
        Ok(())
    }
}

// ── MaskedDense ─────────────────────────────────────────────────────────────

/// Dense layer, kernel laid out `(in, out)`.
#[derive(Debug, Clone)]
pub struct MaskedDense {
    name: String,
    kernel: Var,
    bias: Var,
    mask: Mask,
}

impl MaskedDense {
    pub fn new(name: &str, kernel: Var, bias: Var, mask: Mask) -> Self {
        Self {
            name: name.to_string(),
            kernel,
            bias,
            mask,
        }
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    /// `x: (B, in)` → `(B, out)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.masked_kernel()?;
        Ok(x.matmul(&w)?.broadcast_add(self.bias.as_tensor())?)
    }
}

impl Prunable for MaskedDense {
    fn name(&self) -> &str {
        &self.name
    }
    fn kernel(&self) -> &Var {
        &self.kernel
    }
    fn mask(&self) -> &Mask {
        &self.mask
    }
    fn mask_mut(&mut self) -> &mut Mask {
        &mut self.mask
    }
}

// ── MaskedConv2d ────────────────────────────────────────────────────────────

/// 2-D convolution, stride 1, kernel laid out `(out, in, k, k)`, NCHW input.
#[derive(Debug, Clone)]
pub struct MaskedConv2d {
    name: String,
    kernel: Var,
    bias: Var,
    mask: Mask,
    padding: usize,
}

impl MaskedConv2d {
    pub fn new(name: &str, kernel: Var, bias: Var, mask: Mask, padding: usize) -> Self {
        Self {
            name: name.to_string(),
            kernel,
            bias,
            mask,
            padding,
        }
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.masked_kernel()?;
        let out_channels = self.kernel.dim(0)?;
        let y = x.conv2d(&w, self.padding, 1, 1, 1)?;
        let b = self.bias.as_tensor().reshape((1, out_channels, 1, 1))?;
        Ok(y.broadcast_add(&b)?)
    }
}

impl Prunable for MaskedConv2d {
    fn name(&self) -> &str {
        &self.name
    }
    fn kernel(&self) -> &Var {
        &self.kernel
    }
    fn mask(&self) -> &Mask {
        &self.mask
    }
    fn mask_mut(&mut self) -> &mut Mask {
        &mut self.mask
    }
}
