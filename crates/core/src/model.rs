//! Masked classifier networks built from a [`ModelConfig`].
//!
//! Every weighted layer is [`Prunable`]. All variables live in one
//! [`VarMap`] under stable names (`<layer>.kernel`, `<layer>.bias`,
//! `<layer>.kernel_mask`, `<layer>.kernel_mask_distribution`), which is what
//! checkpoints and the mask-preserving reset key on.

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::{Init, VarMap};
use trune_common::{ConfigError, ModelConfig, MASK_KEYWORD};

use crate::activation::MaskActivation;
use crate::error::Result;
use crate::layer::{MaskedConv2d, MaskedDense, Prunable};
use crate::mask::{Mask, MaskPolicy, MaskState};

/// How freshly built masks are represented.
#[derive(Debug, Clone)]
pub struct MaskOptions {
    pub activation: MaskActivation,
    pub sampling: bool,
    /// Constant the logits start at.
    pub initial_value: f64,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            activation: MaskActivation::Sigmoid,
            sampling: false,
            initial_value: 5.0,
        }
    }
}

enum Layer {
    Dense(MaskedDense),
    Conv(MaskedConv2d),
    Relu,
    MaxPool,
    Flatten,
    GlobalAvgPool,
}

#[derive(Debug, Clone)]
struct Blueprint {
    model: ModelConfig,
    input_shape: [usize; 3],
    n_classes: usize,
    mask: MaskOptions,
}

// ── Builder ─────────────────────────────────────────────────────────────────

struct Builder<'a> {
    varmap: &'a VarMap,
    device: &'a Device,
    mask: &'a MaskOptions,
    layers: Vec<Layer>,
    counter: usize,
}

impl Builder<'_> {
    fn var<S: Into<Shape>>(&self, name: &str, shape: S, init: Init) -> Result<Var> {
        self.varmap.get(shape, name, init, DType::F32, self.device)?;
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
        let var = data
            .get(name)
            .cloned()
            .ok_or_else(|| candle_core::Error::Msg(format!("variable `{name}` was not created")))?;
        Ok(var)
    }

    fn mask(&self, layer: &str, shape: &[usize]) -> Result<Mask> {
        let mask_name = format!("{layer}.{MASK_KEYWORD}");
        let (var, policy) = if self.mask.sampling {
            let distribution = self.var(
                &format!("{mask_name}_distribution"),
                shape,
                Init::Const(self.mask.initial_value),
            )?;
            let realized = self.var(&mask_name, shape, Init::Const(1.0))?;
            (realized, MaskPolicy::Sampled { distribution })
        } else {
            let logits = self.var(&mask_name, shape, Init::Const(self.mask.initial_value))?;
            (logits, MaskPolicy::Deterministic)
        };
        Ok(Mask::new(layer, var, policy, self.mask.activation))
    }

    fn next_name(&mut self, kind: &str) -> String {
        let name = format!("{kind}_{}", self.counter);
        self.counter += 1;
        name
    }

    fn dense(&mut self, fan_in: usize, fan_out: usize) -> Result<()> {
        let name = self.next_name("dense");
        let kernel = self.var(
            &format!("{name}.kernel"),
            (fan_in, fan_out),
            glorot_uniform(fan_in, fan_out),
        )?;
        let bias = self.var(&format!("{name}.bias"), fan_out, Init::Const(0.0))?;
        let mask = self.mask(&name, &[fan_in, fan_out])?;
        self.layers
            .push(Layer::Dense(MaskedDense::new(&name, kernel, bias, mask)));
        Ok(())
    }

    fn conv(&mut self, c_in: usize, c_out: usize, k: usize, padding: usize) -> Result<()> {
        let name = self.next_name("conv");
        let receptive = k * k;
        let kernel = self.var(
            &format!("{name}.kernel"),
            (c_out, c_in, k, k),
            glorot_uniform(c_in * receptive, c_out * receptive),
        )?;
        let bias = self.var(&format!("{name}.bias"), c_out, Init::Const(0.0))?;
        let mask = self.mask(&name, &[c_out, c_in, k, k])?;
        self.layers
            .push(Layer::Conv(MaskedConv2d::new(&name, kernel, bias, mask, padding)));
        Ok(())
    }
}

fn glorot_uniform(fan_in: usize, fan_out: usize) -> Init {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

fn vgg_groups(version: u32) -> Option<[usize; 5]> {
    match version {
        11 => Some([1, 1, 2, 2, 2]),
        13 => Some([2, 2, 2, 2, 2]),
        16 => Some([2, 2, 3, 3, 3]),
        19 => Some([2, 2, 4, 4, 4]),
        _ => None,
    }
}

const VGG_FEATURES: [usize; 5] = [64, 128, 256, 512, 512];

fn too_small(shape: [usize; 3], model: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: "model_config.input_shape".into(),
        reason: format!("{shape:?} is too small for `{model}`"),
    }
}

// ── MaskedNet ───────────────────────────────────────────────────────────────

pub struct MaskedNet {
    varmap: VarMap,
    layers: Vec<Layer>,
    blueprint: Blueprint,
    device: Device,
}

impl MaskedNet {
    /// Build a freshly initialised network.
    ///
    /// `input_shape` (`[h, w, c]`) and `n_classes` come from the dataset unless
    /// the model config overrides them.
    pub fn new(
        model: &ModelConfig,
        input_shape: [usize; 3],
        n_classes: usize,
        mask: &MaskOptions,
        device: &Device,
    ) -> Result<Self> {
        let input_shape = match &model.input_shape {
            None => input_shape,
            Some(s) => match s.as_slice() {
                [h, w, c] => [*h, *w, *c],
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "model_config.input_shape".into(),
                        reason: format!("expected [height, width, channels], got {s:?}"),
                    }
                    .into())
                }
            },
        };
        let blueprint = Blueprint {
            model: model.clone(),
            input_shape,
            n_classes: model.n_classes.unwrap_or(n_classes),
            mask: mask.clone(),
        };
        Self::from_blueprint(blueprint, device)
    }

    fn from_blueprint(blueprint: Blueprint, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let mut b = Builder {
            varmap: &varmap,
            device,
            mask: &blueprint.mask,
            layers: Vec::new(),
            counter: 0,
        };
        let [h, w, c] = blueprint.input_shape;
        let n_classes = blueprint.n_classes;
        let model = &blueprint.model;

        match model.name.as_str() {
            "lenet" => {
                b.layers.push(Layer::Flatten);
                let mut fan_in = h * w * c;
                for &size in &model.layer_sizes {
                    b.dense(fan_in, size)?;
                    b.layers.push(Layer::Relu);
                    fan_in = size;
                }
                b.dense(fan_in, n_classes)?;
            }
            "lenet_conv" => {
                let (mut h, mut w) = (h, w);
                let mut c_in = c;
                for c_out in [20, 50] {
                    if h < 5 || w < 5 {
                        return Err(too_small(blueprint.input_shape, "lenet_conv").into());
                    }
                    b.conv(c_in, c_out, 5, 0)?;
                    b.layers.push(Layer::Relu);
                    (h, w) = (h - 4, w - 4);
                    if h < 2 || w < 2 {
                        return Err(too_small(blueprint.input_shape, "lenet_conv").into());
                    }
                    b.layers.push(Layer::MaxPool);
                    (h, w) = (h / 2, w / 2);
                    c_in = c_out;
                }
                b.layers.push(Layer::Flatten);
                b.dense(c_in * h * w, 500)?;
                b.layers.push(Layer::Relu);
                b.dense(500, n_classes)?;
            }
            "vgg" => {
                let version = model.version.unwrap_or(19);
                let groups = vgg_groups(version).ok_or_else(|| ConfigError::InvalidVersion {
                    model: "vgg".into(),
                    version,
                })?;
                let (mut h, mut w) = (h, w);
                let mut c_in = c;
                for (g, (&size, &width)) in groups.iter().zip(VGG_FEATURES.iter()).enumerate() {
                    // No pooling before the first group; tiny inputs stop shrinking at 1x1.
                    if g > 0 && h >= 2 && w >= 2 {
                        b.layers.push(Layer::MaxPool);
                        (h, w) = (h / 2, w / 2);
                    }
                    for _ in 0..size {
                        b.conv(c_in, width, 3, 1)?;
                        b.layers.push(Layer::Relu);
                        c_in = width;
                    }
                }
                b.layers.push(Layer::GlobalAvgPool);
                b.dense(c_in, n_classes)?;
            }
            other => return Err(ConfigError::UnknownModel(other.to_string()).into()),
        }

        let layers = b.layers;
        let net = Self {
            varmap,
            layers,
            blueprint,
            device: device.clone(),
        };
        let stats = net.stats()?;
        tracing::info!(
            model = %net.blueprint.model.name,
            prunable_layers = net.prunables().len(),
            total_params = stats.total_params,
            prunable_params = stats.prunable_params,
            "model built"
        );
        Ok(net)
    }

    /// Same architecture, new random initialisation.
    pub fn fresh(&self) -> Result<Self> {
        Self::from_blueprint(self.blueprint.clone(), &self.device)
    }

    /// Deep copy: same architecture, same values, same mask states.
    pub fn clone_model(&self) -> Result<Self> {
        let mut copy = self.fresh()?;
        copy.set_all_weights_from(self)?;
        let states: Vec<MaskState> = self.masks().iter().map(|m| m.state()).collect();
        for (layer, state) in copy.prunables_mut().into_iter().zip(states) {
            match state {
                MaskState::Frozen => {
                    let current = layer.mask().var().as_tensor().copy()?;
                    layer.set_mask(&current)?;
                }
                MaskState::Learning => layer.mask_mut().start_learning()?,
                MaskState::Uninitialized => {}
            }
        }
        Ok(copy)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = match layer {
                Layer::Dense(l) => l.forward(&x)?,
                Layer::Conv(l) => l.forward(&x)?,
                Layer::Relu => x.relu()?,
                Layer::MaxPool => x.max_pool2d(2)?,
                Layer::Flatten => x.flatten_from(1)?,
                Layer::GlobalAvgPool => x.flatten_from(2)?.mean(2)?,
            };
        }
        Ok(x)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn name(&self) -> &str {
        &self.blueprint.model.name
    }

    /// `[h, w, c]` the network was built for.
    pub fn input_shape(&self) -> [usize; 3] {
        self.blueprint.input_shape
    }

    pub fn prunables(&self) -> Vec<&dyn Prunable> {
        self.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Dense(d) => Some(d as &dyn Prunable),
                Layer::Conv(c) => Some(c as &dyn Prunable),
                _ => None,
            })
            .collect()
    }

    pub fn prunables_mut(&mut self) -> Vec<&mut dyn Prunable> {
        self.layers
            .iter_mut()
            .filter_map(|l| match l {
                Layer::Dense(d) => Some(d as &mut dyn Prunable),
                Layer::Conv(c) => Some(c as &mut dyn Prunable),
                _ => None,
            })
            .collect()
    }

    pub fn masks(&self) -> Vec<&Mask> {
        self.prunables().into_iter().map(|p| p.mask()).collect()
    }

    /// Kernel and bias variables in layer order; mask tensors excluded.
    pub fn kernel_vars(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        for layer in &self.layers {
            let (name, kernel, bias) = match layer {
                Layer::Dense(d) => (d.name(), d.kernel(), d.bias()),
                Layer::Conv(c) => (c.name(), c.kernel(), c.bias()),
                _ => continue,
            };
            out.push((format!("{name}.kernel"), kernel.clone()));
            out.push((format!("{name}.bias"), bias.clone()));
        }
        out
    }

    /// Every variable by checkpoint name, sorted.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// `l2_reg · Σ kernel²` over all kernels (biases and masks excluded).
    pub fn l2_loss(&self) -> Result<Tensor> {
        let l2 = self.blueprint.model.l2_reg;
        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        if l2 == 0.0 {
            return Ok(total);
        }
        for p in self.prunables() {
            total = (total + p.kernel().as_tensor().sqr()?.sum_all()?)?;
        }
        Ok(total.affine(l2, 0.0)?)
    }

    /// Mean absolute mask multiplier over every prunable weight.
    pub fn density(&self) -> Result<f64> {
        let (mut sum, mut count) = (0.0, 0usize);
        for m in self.masks() {
            let (s, n) = m.mass()?;
            sum += s;
            count += n;
        }
        Ok(if count == 0 { 0.0 } else { sum / count as f64 })
    }

    /// Copy every tensor whose name and shape match `other`.
    ///
    /// Shape mismatches are logged and skipped; returns the number copied.
    pub fn set_all_weights_from(&self, other: &MaskedNet) -> Result<usize> {
        let theirs: std::collections::HashMap<String, Var> =
            other.named_vars()?.into_iter().collect();
        let mut copied = 0;
        for (name, var) in self.named_vars()? {
            match theirs.get(&name) {
                Some(src) if src.dims() == var.dims() => {
                    var.set(&src.as_tensor().copy()?)?;
                    copied += 1;
                }
                Some(src) => tracing::warn!(
                    tensor = %name,
                    ours = ?var.dims(),
                    theirs = ?src.dims(),
                    "shape mismatch, keeping current value"
                ),
                None => tracing::debug!(tensor = %name, "no counterpart in source model"),
            }
        }
        Ok(copied)
    }

    pub fn stats(&self) -> Result<NetStats> {
        let total_params = self.kernel_vars().iter().map(|(_, v)| v.elem_count()).sum();
        let prunable_params = self.prunables().iter().map(|p| p.kernel().elem_count()).sum();
        Ok(NetStats {
            total_params,
            prunable_params,
            density: self.density()?,
        })
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Parameter counts and current mask density.
#[derive(Debug, Clone)]
pub struct NetStats {
    /// Kernels and biases.
    pub total_params: usize,
    pub prunable_params: usize,
    pub density: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            layer_sizes: vec![8, 4],
            ..Default::default()
        }
    }

    fn build(name: &str, shape: [usize; 3]) -> Result<MaskedNet> {
        MaskedNet::new(&config(name), shape, 3, &MaskOptions::default(), &Device::Cpu)
    }

    #[test]
    fn lenet_forward_shape_and_names() {
        let net = build("lenet", [4, 4, 1]).unwrap();
        let x = Tensor::zeros((2, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[2, 3]);
        assert_eq!(net.prunables().len(), 3);
        let names: Vec<String> = net.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"dense_0.kernel_mask".to_string()));
        assert!(names.contains(&"dense_2.bias".to_string()));
    }

    #[test]
    fn vgg_forward_on_tiny_images() {
        let mut cfg = config("vgg");
        cfg.version = Some(11);
        let net =
            MaskedNet::new(&cfg, [4, 4, 3], 10, &MaskOptions::default(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[1, 10]);
        assert_eq!(net.prunables().len(), 9);
    }

    #[test]
    fn unknown_model_and_version_fail_fast() {
        assert!(matches!(
            build("resnet", [4, 4, 1]),
            Err(crate::MaskError::Config(ConfigError::UnknownModel(_)))
        ));
        let mut cfg = config("vgg");
        cfg.version = Some(12);
        let err = MaskedNet::new(&cfg, [4, 4, 3], 10, &MaskOptions::default(), &Device::Cpu);
        assert!(matches!(
            err,
            Err(crate::MaskError::Config(ConfigError::InvalidVersion { .. }))
        ));
    }

    #[test]
    fn masks_start_at_initial_value() {
        let net = build("lenet", [2, 2, 1]).unwrap();
        let m = net.masks()[0].var().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(m.iter().all(|&v| v == 5.0));
        let d = net.density().unwrap();
        assert!((d - MaskActivation::Sigmoid.apply_scalar(5.0) as f64).abs() < 1e-5);
    }

    #[test]
    fn clone_model_copies_values_and_frozen_masks() {
        let mut net = build("lenet", [2, 2, 1]).unwrap();
        let zeros = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        net.prunables_mut()[0].set_mask(&zeros).unwrap();
        let copy = net.clone_model().unwrap();
        assert!(copy.masks()[0].is_frozen());
        let a = net.kernel_vars()[0].1.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = copy.kernel_vars()[0].1.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn weight_copy_skips_shape_mismatch() {
        let small = build("lenet", [2, 2, 1]).unwrap();
        let big = build("lenet", [3, 3, 1]).unwrap();
        // dense_0 tensors differ in fan-in; everything else matches.
        let copied = small.set_all_weights_from(&big).unwrap();
        let total = small.named_vars().unwrap().len();
        assert_eq!(copied, total - 2);
    }
}
