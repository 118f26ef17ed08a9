use candle_core::{Device, Tensor};
use trune_common::{load_dataset, Dataset, ExperimentConfig, ExperimentSpec, ModelConfig};
use trune_core::{MaskOptions, MaskedNet, Prunable};
use trune_train::{reset_keeping_masks, save_checkpoint, MaskedTrainer};

fn net() -> MaskedNet {
    let cfg = ModelConfig {
        name: "lenet".into(),
        layer_sizes: vec![16],
        ..Default::default()
    };
    MaskedNet::new(&cfg, [2, 2, 1], 2, &MaskOptions::default(), &Device::Cpu).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn experiment() -> (ExperimentConfig, Dataset) {
    let spec = ExperimentSpec::from_value(
        serde_yaml::from_str(
            "steps: 3\ndataset: test\ndataset_config: {image_shape: [2, 2, 1], train_batch_size: 2}\n",
        )
        .unwrap(),
    )
    .unwrap();
    let cfg = ExperimentConfig::from_spec(&spec).unwrap();
    let ds = load_dataset(&cfg.dataset, 0).unwrap();
    (cfg, ds)
}

#[test]
fn reset_to_other_checkpoint_keeps_live_masks() {
    let dir = tempfile::tempdir().unwrap();
    let other_path = dir.path().join("other.safetensors");

    let other = net();
    for m in other.masks() {
        m.fill(-3.0).unwrap();
    }
    save_checkpoint(&other, &other_path).unwrap();

    let live = net();
    for m in live.masks() {
        m.fill(2.0).unwrap();
    }
    let masks_before: Vec<_> = live.masks().iter().map(|m| values(m.var())).collect();

    let skipped = reset_keeping_masks(&live, Some(&other_path)).unwrap();
    assert_eq!(skipped, live.masks().len());

    for ((_, ours), (_, theirs)) in live.kernel_vars().iter().zip(other.kernel_vars().iter()) {
        assert_eq!(values(ours), values(theirs));
    }
    let masks_after: Vec<_> = live.masks().iter().map(|m| values(m.var())).collect();
    assert_eq!(masks_before, masks_after);
}

#[test]
fn frozen_masks_survive_training_steps() {
    let (cfg, ds) = experiment();
    let mut model = net();
    for layer in model.prunables_mut() {
        let keep = layer.kernel().as_tensor().ones_like().unwrap();
        layer.set_mask(&keep).unwrap();
    }
    let frozen: Vec<_> = model.masks().iter().map(|m| values(m.var())).collect();
    let kernel_before = values(model.kernel_vars()[0].1.as_tensor());

    let mut trainer = MaskedTrainer::new(model, &cfg).unwrap();
    let mut stream = ds.train_stream(0);
    for _ in 0..2 {
        let (x, y) = stream.next().unwrap();
        trainer.step(&x, &y).unwrap();
    }

    let after: Vec<_> = trainer.model.masks().iter().map(|m| values(m.var())).collect();
    assert_eq!(frozen, after);
    assert_ne!(kernel_before, values(trainer.model.kernel_vars()[0].1.as_tensor()));
}

#[test]
fn learning_masks_move_and_stay_clipped() {
    let (cfg, ds) = experiment();
    let model = net();
    let before: Vec<_> = model.masks().iter().map(|m| values(m.var())).collect();

    let mut trainer = MaskedTrainer::new(model, &cfg).unwrap();
    let mut stream = ds.train_stream(0);
    let (x, y) = stream.next().unwrap();
    let metrics = trainer.step(&x, &y).unwrap();
    assert!(!metrics.skipped);

    let after: Vec<_> = trainer.model.masks().iter().map(|m| values(m.var())).collect();
    assert_ne!(before, after);
    let bound = cfg.mask.clip as f32;
    assert!(after.iter().flatten().all(|v| v.abs() <= bound));
}
