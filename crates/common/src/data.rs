//! Data pipeline stand-ins: in-memory image classification datasets and batching.
//!
//! Images are stored channel-first (`C, H, W`) as `f32`; labels are class
//! indices. Batches are `(images, labels)` flat vectors; [`batch_to_tensors`]
//! turns them into `(B, C, H, W)` / `(B,)` tensors.
//!
//! * **[`InMemoryDataset`]** — one split held in RAM.
//! * **[`Dataset`]** — train + validation splits with batch sizes.
//! * **[`TrainStream`]** — endless reshuffling train batch source.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::DatasetConfig;
use crate::error::ConfigError;

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for datasets that yield `(images, labels)` batches.
pub trait BatchDataset {
    fn num_samples(&self) -> usize;
    /// `[channels, height, width]` of one sample.
    fn sample_shape(&self) -> [usize; 3];
    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_>;
}

// ── InMemoryDataset ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Vec<f32>,
    labels: Vec<u32>,
    shape: [usize; 3],
}

impl InMemoryDataset {
    pub fn new(images: Vec<f32>, labels: Vec<u32>, shape: [usize; 3]) -> anyhow::Result<Self> {
        let per_sample = shape.iter().product::<usize>();
        if per_sample == 0 || images.len() != labels.len() * per_sample {
            anyhow::bail!(
                "dataset has {} values for {} labels of shape {:?}",
                images.len(),
                labels.len(),
                shape
            );
        }
        Ok(Self {
            images,
            labels,
            shape,
        })
    }

    fn sample_len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Gather the samples at `indices` into one flat batch.
    pub fn gather(&self, indices: &[usize]) -> (Vec<f32>, Vec<u32>) {
        let n = self.sample_len();
        let mut images = Vec::with_capacity(indices.len() * n);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            images.extend_from_slice(&self.images[i * n..(i + 1) * n]);
            labels.push(self.labels[i]);
        }
        (images, labels)
    }
}

impl BatchDataset for InMemoryDataset {
    fn num_samples(&self) -> usize {
        self.labels.len()
    }

    fn sample_shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Sequential batches; the last one may be short.
    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_> {
        let n = self.sample_len();
        let batch_size = batch_size.max(1);
        Box::new(
            self.labels
                .chunks(batch_size)
                .zip(self.images.chunks(batch_size * n))
                .map(|(l, x)| (x.to_vec(), l.to_vec())),
        )
    }
}

// ── Dataset ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub train: InMemoryDataset,
    pub valid: InMemoryDataset,
    /// `[height, width, channels]`, the layout model configs are written in.
    pub input_shape: [usize; 3],
    pub n_classes: usize,
    pub train_batch_size: usize,
    pub valid_batch_size: usize,
}

impl Dataset {
    /// Endless shuffled train batches, reshuffled every pass.
    pub fn train_stream(&self, seed: u64) -> TrainStream<'_> {
        TrainStream::new(&self.train, self.train_batch_size, seed)
    }

    pub fn valid_batches(&self) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_> {
        self.valid.batches(self.valid_batch_size)
    }
}

pub struct TrainStream<'a> {
    data: &'a InMemoryDataset,
    batch_size: usize,
    order: Vec<usize>,
    pos: usize,
    rng: StdRng,
}

impl<'a> TrainStream<'a> {
    fn new(data: &'a InMemoryDataset, batch_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..data.num_samples()).collect();
        order.shuffle(&mut rng);
        Self {
            data,
            batch_size: batch_size.clamp(1, data.num_samples().max(1)),
            order,
            pos: 0,
            rng,
        }
    }
}

impl Iterator for TrainStream<'_> {
    type Item = (Vec<f32>, Vec<u32>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.order.is_empty() {
            return None;
        }
        if self.pos + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.pos = 0;
        }
        let idx = &self.order[self.pos..self.pos + self.batch_size];
        self.pos += self.batch_size;
        Some(self.data.gather(idx))
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Build the named dataset. `seed` makes synthetic data reproducible.
pub fn load_dataset(config: &DatasetConfig, seed: u64) -> std::result::Result<Dataset, ConfigError> {
    let (h, w, c) = match config.image_shape.as_slice() {
        [h, w, c] if h * w * c > 0 => (*h, *w, *c),
        other => {
            return Err(ConfigError::InvalidValue {
                key: "dataset_config.image_shape".into(),
                reason: format!("expected [height, width, channels], got {other:?}"),
            })
        }
    };
    let shape = [c, h, w];
    let (train, valid, n_classes) = match config.name.as_str() {
        "synthetic" => {
            if config.n_classes < 2 {
                return Err(ConfigError::InvalidValue {
                    key: "dataset_config.n_classes".into(),
                    reason: "need at least two classes".into(),
                });
            }
            let mut rng = StdRng::seed_from_u64(seed);
            let centres: Vec<Vec<f32>> = (0..config.n_classes)
                .map(|_| (0..c * h * w).map(|_| gaussian(&mut rng)).collect())
                .collect();
            let train = blobs(&centres, config.train_samples, config.noise, shape, &mut rng);
            let valid = blobs(&centres, config.valid_samples, config.noise, shape, &mut rng);
            (train, valid, config.n_classes)
        }
        "test" => {
            let pair = constant_pair(shape);
            (pair.clone(), pair, 2)
        }
        other => return Err(ConfigError::UnknownDataset(other.to_string())),
    };
    tracing::debug!(
        dataset = %config.name,
        train = train.num_samples(),
        valid = valid.num_samples(),
        n_classes,
        "dataset ready"
    );
    Ok(Dataset {
        name: config.name.clone(),
        train,
        valid,
        input_shape: [h, w, c],
        n_classes,
        train_batch_size: config.train_batch_size,
        valid_batch_size: config.valid_batch_size,
    })
}

/// Standard normal draw (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

fn blobs(
    centres: &[Vec<f32>],
    samples: usize,
    noise: f32,
    shape: [usize; 3],
    rng: &mut StdRng,
) -> InMemoryDataset {
    let n = shape.iter().product::<usize>();
    let mut images = Vec::with_capacity(samples * n);
    let mut labels = Vec::with_capacity(samples);
    for i in 0..samples {
        let class = i % centres.len();
        images.extend(centres[class].iter().map(|&m| m + noise * gaussian(rng)));
        labels.push(class as u32);
    }
    InMemoryDataset {
        images,
        labels,
        shape,
    }
}

/// All-zeros image labelled 0 and all-ones image labelled 1.
fn constant_pair(shape: [usize; 3]) -> InMemoryDataset {
    let n = shape.iter().product::<usize>();
    let mut images = vec![0.0f32; n];
    images.extend(std::iter::repeat(1.0f32).take(n));
    InMemoryDataset {
        images,
        labels: vec![0, 1],
        shape,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch to `(B, C, H, W)` f32 images and `(B,)` u32 labels.
pub fn batch_to_tensors(
    images: &[f32],
    labels: &[u32],
    shape: [usize; 3],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let b = labels.len();
    let [c, h, w] = shape;
    let x = Tensor::from_slice(images, (b, c, h, w), device)?;
    let y = Tensor::from_slice(labels, b, device)?;
    Ok((x, y))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(name: &str) -> DatasetConfig {
        DatasetConfig {
            name: name.into(),
            train_batch_size: 4,
            valid_batch_size: 8,
            train_samples: 10,
            valid_samples: 6,
            image_shape: vec![4, 4, 1],
            n_classes: 3,
            noise: 0.1,
        }
    }

    #[test]
    fn synthetic_is_deterministic_per_seed() {
        let a = load_dataset(&small_config("synthetic"), 7).unwrap();
        let b = load_dataset(&small_config("synthetic"), 7).unwrap();
        assert_eq!(a.train.gather(&[0, 1]), b.train.gather(&[0, 1]));
        assert_eq!(a.input_shape, [4, 4, 1]);
        assert_eq!(a.train.sample_shape(), [1, 4, 4]);
    }

    #[test]
    fn unknown_dataset_fails_fast() {
        let err = load_dataset(&small_config("imagenet"), 0).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDataset(_)));
    }

    #[test]
    fn sequential_batches_cover_the_split() {
        let ds = load_dataset(&small_config("synthetic"), 1).unwrap();
        let sizes: Vec<usize> = ds.train.batches(4).map(|(_, l)| l.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn train_stream_never_ends_and_keeps_batch_size() {
        let ds = load_dataset(&small_config("synthetic"), 1).unwrap();
        let mut stream = ds.train_stream(3);
        for _ in 0..10 {
            let (x, y) = stream.next().unwrap();
            assert_eq!(y.len(), 4);
            assert_eq!(x.len(), 4 * 16);
        }
    }

    #[test]
    fn test_dataset_has_two_constant_images() {
        let ds = load_dataset(&small_config("test"), 0).unwrap();
        assert_eq!(ds.n_classes, 2);
        let (x, y) = ds.valid.gather(&[0, 1]);
        assert_eq!(y, vec![0, 1]);
        assert!(x[..16].iter().all(|&v| v == 0.0));
        assert!(x[16..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn batch_to_tensors_shapes() {
        let (x, y) =
            batch_to_tensors(&[0.0; 2 * 3 * 2 * 2], &[0, 1], [3, 2, 2], &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[2, 3, 2, 2]);
        assert_eq!(y.dims(), &[2]);
    }
}
