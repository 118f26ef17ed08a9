//! Threshold selection against a reference mask.
//!
//! Reference values are ground-truth labels (nonzero = kept); candidate
//! values, after the mask activation and `abs`, are prediction scores. A
//! precision/recall curve over every distinct score picks the operating
//! threshold, either at best F1 or just above a forced sparsity quantile.

use candle_core::{DType, Tensor};

use crate::activation::MaskActivation;
use crate::error::{MaskError, Result};

/// Precision and recall at each threshold; thresholds ascend.
#[derive(Debug, Clone, PartialEq)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f32>,
}

impl PrCurve {
    /// `2pr / (p + r)`, or `-1` where `p + r == 0`.
    pub fn f1_scores(&self) -> Vec<f64> {
        self.precision
            .iter()
            .zip(&self.recall)
            .map(|(&p, &r)| if p + r > 0.0 { 2.0 * p * r / (p + r) } else { -1.0 })
            .collect()
    }
}

/// Outcome of a comparison at the chosen operating point.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub threshold: f32,
    /// Fraction of candidate scores `>= threshold`.
    pub density: f64,
}

/// Sweep every distinct score as a threshold; a score is predicted positive
/// when it is `>=` the threshold.
pub fn precision_recall_curve(labels: &[bool], scores: &[f32]) -> Result<PrCurve> {
    if labels.len() != scores.len() {
        return Err(MaskError::LengthMismatch {
            reference: labels.len(),
            candidate: scores.len(),
        });
    }
    if scores.is_empty() {
        return Err(MaskError::Empty);
    }
    let mut pairs: Vec<(f32, bool)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    // Descending, so a running sum gives tp/fp for "score >= threshold".
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    let positives = labels.iter().filter(|&&l| l).count() as f64;

    let (mut tp, mut fp) = (0usize, 0usize);
    let mut points = Vec::new();
    for (i, &(score, label)) in pairs.iter().enumerate() {
        if label {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_run = pairs.get(i + 1).map_or(true, |next| next.0 != score);
        if last_of_run {
            let precision = tp as f64 / (tp + fp) as f64;
            let recall = if positives > 0.0 { tp as f64 / positives } else { 0.0 };
            points.push((score, precision, recall));
        }
    }
    points.reverse();
    Ok(PrCurve {
        precision: points.iter().map(|p| p.1).collect(),
        recall: points.iter().map(|p| p.2).collect(),
        thresholds: points.iter().map(|p| p.0).collect(),
    })
}

/// Compare flat labels and scores.
///
/// Without `force_sparsity` the first index with maximal F1 wins, so when
/// every F1 is `-1` the lowest threshold is chosen. With `force_sparsity = s`
/// the cut is `sorted(scores)[floor(n·s)]` and the chosen threshold is the
/// first one strictly above it, or the highest threshold if none is.
pub fn compare_scores(
    labels: &[bool],
    scores: &[f32],
    force_sparsity: Option<f64>,
) -> Result<Comparison> {
    let curve = precision_recall_curve(labels, scores)?;
    let f1 = curve.f1_scores();

    let idx = match force_sparsity {
        None => {
            let mut best = 0;
            for (i, &v) in f1.iter().enumerate() {
                if v > f1[best] {
                    best = i;
                }
            }
            best
        }
        Some(s) => {
            let mut sorted = scores.to_vec();
            sorted.sort_by(f32::total_cmp);
            let q = ((sorted.len() as f64 * s) as usize).min(sorted.len() - 1);
            let cut = sorted[q];
            curve
                .thresholds
                .iter()
                .position(|&t| t > cut)
                .unwrap_or(curve.thresholds.len() - 1)
        }
    };

    let threshold = curve.thresholds[idx];
    let kept = scores.iter().filter(|&&s| s >= threshold).count();
    Ok(Comparison {
        f1: f1[idx],
        precision: curve.precision[idx],
        recall: curve.recall[idx],
        threshold,
        density: kept as f64 / scores.len() as f64,
    })
}

/// Compare per-layer reference masks with per-layer candidate logits.
///
/// Both sides are flattened and concatenated in order; candidates become
/// scores via `|activation(x)|`.
pub fn compare(
    reference: &[Tensor],
    candidate: &[Tensor],
    activation: MaskActivation,
    force_sparsity: Option<f64>,
) -> Result<Comparison> {
    let labels: Vec<bool> = flatten(reference)?.into_iter().map(|v| v != 0.0).collect();
    let scores = candidate_scores(candidate, activation)?;
    compare_scores(&labels, &scores, force_sparsity)
}

/// `|activation(x)|` for every candidate element, flattened in order.
pub fn candidate_scores(candidate: &[Tensor], activation: MaskActivation) -> Result<Vec<f32>> {
    Ok(flatten(candidate)?
        .into_iter()
        .map(|v| activation.apply_scalar(v).abs())
        .collect())
}

fn flatten(tensors: &[Tensor]) -> Result<Vec<f32>> {
    let mut out = Vec::new();
    for t in tensors {
        out.extend(t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn perfect_separation_gives_unit_f1() {
        let labels = [true, true, false, false];
        let scores = [0.9, 0.8, 0.3, 0.1];
        let c = compare_scores(&labels, &scores, None).unwrap();
        assert!(c.threshold <= 0.8 && c.threshold > 0.3);
        assert_eq!(c.f1, 1.0);
        assert_eq!(c.density, 0.5);
    }

    #[test]
    fn curve_thresholds_are_distinct_and_ascending() {
        let labels = [true, false, true, false];
        let scores = [0.5, 0.5, 0.7, 0.1];
        let curve = precision_recall_curve(&labels, &scores).unwrap();
        assert_eq!(curve.thresholds, vec![0.1, 0.5, 0.7]);
        assert_eq!(curve.recall, vec![1.0, 1.0, 0.5]);
        assert_eq!(curve.precision, vec![0.5, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn forced_sparsity_picks_first_threshold_above_quantile() {
        let scores: Vec<f32> = (1..=10).map(|i| i as f32 / 10.0).collect();
        let labels = vec![true; 10];
        // cut = sorted[floor(10 * 0.8)] = 0.9; the next threshold keeps one score.
        let c = compare_scores(&labels, &scores, Some(0.8)).unwrap();
        assert_eq!(c.threshold, scores[9]);
        assert_eq!(c.density, 0.1);

        // cut = sorted[5] = 0.6; threshold 0.7 keeps four.
        let c = compare_scores(&labels, &scores, Some(0.5)).unwrap();
        assert_eq!(c.threshold, scores[6]);
        assert_eq!(c.density, 0.4);
    }

    #[test]
    fn degenerate_scores_pick_first_index() {
        // No positives: every precision + recall is zero, so F1 is -1 everywhere.
        let labels = [false, false, false];
        let scores = [0.2, 0.2, 0.2];
        let c = compare_scores(&labels, &scores, None).unwrap();
        assert_eq!(c.f1, -1.0);
        assert_eq!(c.threshold, 0.2);
        assert_eq!(c.density, 1.0);
    }

    #[test]
    fn mismatched_or_empty_inputs_fail() {
        assert!(matches!(
            compare_scores(&[true], &[0.1, 0.2], None),
            Err(MaskError::LengthMismatch { .. })
        ));
        assert!(matches!(compare_scores(&[], &[], None), Err(MaskError::Empty)));
    }

    #[test]
    fn tensors_are_flattened_across_layers() {
        let dev = Device::Cpu;
        let reference = [
            Tensor::new(&[[1.0f32, 0.0]], &dev).unwrap(),
            Tensor::new(&[1.0f32, 0.0], &dev).unwrap(),
        ];
        let candidate = [
            Tensor::new(&[[0.9f32, -0.1]], &dev).unwrap(),
            Tensor::new(&[-0.8f32, 0.05], &dev).unwrap(),
        ];
        let c = compare(&reference, &candidate, MaskActivation::Identity, None).unwrap();
        assert_eq!(c.f1, 1.0);
        assert_eq!(c.density, 0.5);
    }
}
