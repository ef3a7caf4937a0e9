//! Per-layer statistics over decoded logits
//!
//! Every metric works along the last (vocabulary) axis and leaves leading
//! batch / sequence axes untouched:
//!
//! - `probability`: softmax, same shape as the input
//! - `rank`: 1-based rank by descending probability, same shape as the input
//! - `entropy`: Shannon entropy in nats, the vocabulary axis is reduced
//!
//! Inputs are never mutated; all results are F32.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

/// Statistic computed from each layer's decoded distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Softmax probability of each vocabulary entry
    Probability,
    /// 1-based rank of each vocabulary entry
    Rank,
    /// Entropy of the whole distribution (one scalar per position)
    Entropy,
}

impl Metric {
    /// Apply this metric to a `[..., vocab]` logits tensor
    pub fn apply(self, logits: &Tensor) -> Result<Tensor> {
        match self {
            Metric::Probability => probability(logits),
            Metric::Rank => rank(logits),
            Metric::Entropy => entropy(logits),
        }
    }

    /// True when the metric collapses the vocabulary axis
    pub fn reduces_vocab(self) -> bool {
        matches!(self, Metric::Entropy)
    }

    /// Default number of top-k selections when the request names none
    pub fn default_top_k(self) -> usize {
        match self {
            Metric::Entropy => 0,
            Metric::Probability | Metric::Rank => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Probability => "probability",
            Metric::Rank => "rank",
            Metric::Entropy => "entropy",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "probability" | "prob" => Ok(Metric::Probability),
            "rank" => Ok(Metric::Rank),
            "entropy" => Ok(Metric::Entropy),
            other => anyhow::bail!("Unknown metric '{other}' (expected probability, rank or entropy)"),
        }
    }
}

/// Softmax over the vocabulary axis
pub fn probability(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?.contiguous()?;
    Ok(candle_nn::ops::softmax_last_dim(&logits)?)
}

/// 1-based rank of every vocabulary entry by descending logit
///
/// Softmax is monotonic, so ranking logits is the same as ranking
/// probabilities. Equal values keep vocabulary order: the lower token id
/// gets the better rank.
pub fn rank(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let vocab = logits.dim(D::Minus1)?;
    anyhow::ensure!(vocab > 0, "Cannot rank an empty vocabulary axis");

    let flat: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    let mut ranks = vec![0f32; flat.len()];

    for (row, out) in flat.chunks(vocab).zip(ranks.chunks_mut(vocab)) {
        for (position, token) in descending_order(row).into_iter().enumerate() {
            out[token] = (position + 1) as f32;
        }
    }

    Ok(Tensor::from_vec(ranks, logits.dims(), logits.device())?)
}

/// Shannon entropy (nats) per position, via log-softmax
pub fn entropy(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?.contiguous()?;
    let log_p = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let p = log_p.exp()?;
    let terms = (&p * &log_p)?;
    // 0 * ln(0) contributes nothing
    let terms = p.gt(0f32)?.where_cond(&terms, &terms.zeros_like()?)?;
    Ok(terms.sum(D::Minus1)?.neg()?)
}

/// Indices of `row` sorted by descending value
///
/// The sort is stable, so ties stay in ascending index order.
pub(crate) fn descending_order(row: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn row(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_probability_rows_sum_to_one() {
        let logits = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [10.0, -5.0, 0.0, 0.5]], &Device::Cpu)
            .unwrap();
        let probs: Vec<Vec<f32>> = probability(&logits).unwrap().to_vec2().unwrap();

        for p in &probs {
            let sum: f32 = p.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
        }
        assert!(probs[0][3] > probs[0][2]);
    }

    #[test]
    fn test_probability_is_stable_for_large_logits() {
        let probs: Vec<f32> = probability(&row(&[1000.0, 1000.0])).unwrap().to_vec1().unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_rank_orders_by_descending_value() {
        let ranks: Vec<f32> = rank(&row(&[0.1, 3.0, -2.0, 1.5])).unwrap().to_vec1().unwrap();
        assert_eq!(ranks, vec![3.0, 1.0, 4.0, 2.0]);
    }

    #[test]
    fn test_rank_ties_favor_lower_token_id() {
        let ranks: Vec<f32> = rank(&row(&[2.0, 5.0, 2.0, 5.0])).unwrap().to_vec1().unwrap();
        // 1 and 3 tie for first, 0 and 2 tie for third
        assert_eq!(ranks, vec![3.0, 1.0, 4.0, 2.0]);
    }

    #[test]
    fn test_rank_keeps_leading_axes() {
        let logits = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0]]], &Device::Cpu).unwrap();
        let ranks = rank(&logits).unwrap();
        assert_eq!(ranks.dims(), &[1, 2, 2]);
        let ranks: Vec<Vec<f32>> = ranks.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(ranks, vec![vec![1.0, 2.0], vec![2.0, 1.0]]);
    }

    #[test]
    fn test_entropy_uniform_is_ln_vocab() {
        let h: Vec<f32> = entropy(&Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap())
            .unwrap()
            .to_vec1()
            .unwrap();
        for value in h {
            assert!((value - (8f32).ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_entropy_one_hot_is_zero() {
        let h: Vec<f32> = entropy(&row(&[0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]))
            .unwrap()
            .reshape(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(h[0].abs() < 1e-6, "entropy was {}", h[0]);
    }

    #[test]
    fn test_entropy_reduces_vocab_axis() {
        let logits = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(entropy(&logits).unwrap().dims(), &[3]);
        assert!(Metric::Entropy.reduces_vocab());
        assert!(!Metric::Rank.reduces_vocab());
    }

    #[test]
    fn test_metric_does_not_mutate_input() {
        let logits = row(&[1.0, 2.0, 3.0]);
        for metric in [Metric::Probability, Metric::Rank, Metric::Entropy] {
            metric.apply(&logits).unwrap();
        }
        let after: Vec<f32> = logits.to_vec1().unwrap();
        assert_eq!(after, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_metric_parse_and_serde() {
        assert_eq!("Rank".parse::<Metric>().unwrap(), Metric::Rank);
        assert!("loss".parse::<Metric>().is_err());
        assert_eq!(serde_json::to_string(&Metric::Entropy).unwrap(), "\"entropy\"");
        assert_eq!(Metric::Entropy.default_top_k(), 0);
        assert_eq!(Metric::Probability.default_top_k(), 1);
    }
}
