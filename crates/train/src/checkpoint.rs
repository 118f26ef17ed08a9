//! Checkpoint persistence and mask-preserving resets.
//!
//! Checkpoints are safetensors files keyed by variable name (see
//! [`MaskedNet::named_vars`]). A name containing [`MASK_KEYWORD`] identifies
//! a mask tensor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::DType;

use trune_common::MASK_KEYWORD;
use trune_core::MaskedNet;

use crate::optim::MomentumSgd;

/// What a load did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Variables left untouched because their name matched the skip keyword.
    pub skipped: usize,
    /// Variables the file had no tensor for.
    pub missing: Vec<String>,
}

pub fn save_checkpoint(model: &MaskedNet, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    model
        .varmap()
        .save(path)
        .with_context(|| format!("save checkpoint to {}", path.display()))?;
    Ok(())
}

/// Load every variable found in `path`, leaving names that contain
/// `skip_keyword` untouched. A shape disagreement is an error.
pub fn load_checkpoint(
    model: &MaskedNet,
    path: &Path,
    skip_keyword: Option<&str>,
) -> Result<LoadReport> {
    let tensors = candle_core::safetensors::load(path, model.device())
        .with_context(|| format!("load checkpoint {}", path.display()))?;
    let mut report = LoadReport::default();
    for (name, var) in model.named_vars()? {
        if skip_keyword.is_some_and(|k| name.contains(k)) {
            report.skipped += 1;
            continue;
        }
        match tensors.get(&name) {
            Some(t) if t.dims() == var.dims() => {
                var.set(&t.to_dtype(DType::F32)?)?;
                report.loaded += 1;
            }
            Some(t) => bail!(
                "checkpoint tensor `{name}` has shape {:?}, model expects {:?}",
                t.dims(),
                var.dims()
            ),
            None => report.missing.push(name),
        }
    }
    if !report.missing.is_empty() {
        tracing::warn!(
            path = %path.display(),
            missing = ?report.missing,
            "checkpoint lacks some variables, keeping their current values"
        );
    }
    Ok(report)
}

/// Reset the model in place to `ckp` (or to a fresh random initialisation when
/// `None`), skipping every variable whose name contains `skip_keyword`.
///
/// Returns the number of skipped variables.
pub fn reset_weights_to_checkpoint(
    model: &MaskedNet,
    ckp: Option<&Path>,
    skip_keyword: &str,
) -> Result<usize> {
    let skipped = match ckp {
        Some(path) => load_checkpoint(model, path, Some(skip_keyword))?.skipped,
        None => {
            let fresh = model.fresh()?;
            let theirs: std::collections::HashMap<_, _> = fresh.named_vars()?.into_iter().collect();
            let mut skipped = 0;
            for (name, var) in model.named_vars()? {
                if name.contains(skip_keyword) {
                    skipped += 1;
                } else if let Some(src) = theirs.get(&name) {
                    var.set(&src.as_tensor().copy()?)?;
                }
            }
            skipped
        }
    };
    tracing::info!(skipped, keyword = skip_keyword, "reset weights, keeping matching tensors");
    Ok(skipped)
}

/// Convenience for the common case of preserving every mask tensor.
pub fn reset_keeping_masks(model: &MaskedNet, ckp: Option<&Path>) -> Result<usize> {
    reset_weights_to_checkpoint(model, ckp, MASK_KEYWORD)
}

// ── EpochCheckpointer ───────────────────────────────────────────────────────

/// Saves model and optimiser state at the epochs listed in `{epoch: path}`
/// maps. Epoch `-1` is the state before any training.
#[derive(Debug, Clone, Default)]
pub struct EpochCheckpointer {
    model_paths: BTreeMap<i64, String>,
    optim_paths: BTreeMap<i64, String>,
    created: Vec<PathBuf>,
}

impl EpochCheckpointer {
    pub fn new(model_paths: BTreeMap<i64, String>, optim_paths: BTreeMap<i64, String>) -> Self {
        Self {
            model_paths,
            optim_paths,
            created: Vec::new(),
        }
    }

    pub fn on_epoch_end(
        &mut self,
        epoch: i64,
        model: &MaskedNet,
        optimizer: Option<&MomentumSgd>,
    ) -> Result<()> {
        if let Some(path) = self.model_paths.get(&epoch) {
            let path = PathBuf::from(path);
            save_checkpoint(model, &path)?;
            tracing::info!(epoch, path = %path.display(), "saved model");
            self.created.push(path);
        }
        if let (Some(path), Some(opt)) = (self.optim_paths.get(&epoch), optimizer) {
            let path = PathBuf::from(path);
            opt.save(&path)?;
            tracing::info!(epoch, path = %path.display(), "saved optimizer");
            self.created.push(path);
        }
        Ok(())
    }

    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use trune_common::ModelConfig;
    use trune_core::MaskOptions;

    fn net() -> MaskedNet {
        let cfg = ModelConfig {
            name: "lenet".into(),
            layer_sizes: vec![3],
            ..Default::default()
        };
        MaskedNet::new(&cfg, [2, 2, 1], 2, &MaskOptions::default(), &Device::Cpu).unwrap()
    }

    #[test]
    fn checkpointer_saves_only_listed_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let p = |n: &str| dir.path().join(n).to_string_lossy().to_string();
        let mut ckp = EpochCheckpointer::new(
            BTreeMap::from([(-1, p("init.safetensors")), (1, p("one.safetensors"))]),
            BTreeMap::new(),
        );
        let model = net();
        for epoch in -1..3 {
            ckp.on_epoch_end(epoch, &model, None).unwrap();
        }
        assert_eq!(ckp.created().len(), 2);
        assert!(dir.path().join("init.safetensors").exists());
        assert!(!dir.path().join("zero.safetensors").exists());
    }

    #[test]
    fn random_reset_keeps_masks_and_counts_them() {
        let model = net();
        let mask_before = model.masks()[0].var().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let kernel_before = model.kernel_vars()[0].1.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let skipped = reset_keeping_masks(&model, None).unwrap();
        assert_eq!(skipped, model.masks().len());
        let mask_after = model.masks()[0].var().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let kernel_after = model.kernel_vars()[0].1.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(mask_before, mask_after);
        assert_ne!(kernel_before, kernel_after);
    }
}
