//! Target-id and top-k selection over per-layer metric tensors
//!
//! Selection runs after the metric and before shaping. Its output is the
//! raw payload of a job: per layer, a values matrix and a parallel indices
//! matrix (rows = positions, columns = selections).

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::metrics::{descending_order, Metric};

/// Sequence position named by a request
///
/// Integers index from the start, negative integers from the end, and the
/// keyword `"last"` names the final token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenPosition {
    Index(i64),
    Keyword(PositionKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionKeyword {
    Last,
}

impl TokenPosition {
    pub const LAST: TokenPosition = TokenPosition::Keyword(PositionKeyword::Last);

    /// Resolve against a prompt of `seq_len` tokens
    pub fn resolve(self, seq_len: usize) -> Result<usize> {
        anyhow::ensure!(seq_len > 0, "Cannot index into an empty prompt");
        let index = match self {
            TokenPosition::Keyword(PositionKeyword::Last) => return Ok(seq_len - 1),
            TokenPosition::Index(i) if i < 0 => seq_len as i64 + i,
            TokenPosition::Index(i) => i,
        };
        anyhow::ensure!(
            (0..seq_len as i64).contains(&index),
            "Token position {self} out of range for a prompt of {seq_len} tokens"
        );
        Ok(index as usize)
    }
}

impl std::fmt::Display for TokenPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenPosition::Index(i) => write!(f, "{i}"),
            TokenPosition::Keyword(PositionKeyword::Last) => f.write_str("last"),
        }
    }
}

/// How entries are chosen from each layer's metric tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Selection {
    /// The same token ids at every position, in the given order
    Targets { ids: Vec<u32> },
    /// The final-layer top prediction of each position
    TopPredictions,
    /// The `k` best entries per position
    TopK { k: usize },
    /// One scalar per position (vocabulary-reducing metrics)
    Scalar,
}

/// Selected entries of one layer
///
/// `values[r]` and `indices[r]` are parallel for every row `r`, except for
/// scalar selections where `indices[r]` is empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerSelection {
    pub values: Vec<Vec<f32>>,
    pub indices: Vec<Vec<u32>>,
}

/// Select entries from every layer's metric tensor
///
/// - `metric_layers`: `[seq, vocab]` (or `[seq]` for entropy) per layer
/// - `position`: when set, only that row is kept
/// - `top_predictions`: final-layer top prediction per position, used by
///   [`Selection::TopPredictions`]
pub fn select(
    metric_layers: &[Tensor],
    metric: Metric,
    position: Option<usize>,
    selection: &Selection,
    top_predictions: &[u32],
) -> Result<Vec<LayerSelection>> {
    metric_layers
        .iter()
        .enumerate()
        .map(|(layer, tensor)| {
            select_layer(tensor, metric, position, selection, top_predictions)
                .map_err(|e| e.context(format!("layer {layer}")))
        })
        .collect()
}

fn select_layer(
    tensor: &Tensor,
    metric: Metric,
    position: Option<usize>,
    selection: &Selection,
    top_predictions: &[u32],
) -> Result<LayerSelection> {
    let (positions, rows) = metric_rows(tensor, position)?;

    let mut out = LayerSelection::default();
    for (&pos, row) in positions.iter().zip(&rows) {
        let (values, indices) = match (selection, tensor.rank()) {
            (Selection::Scalar, 1) => (row.clone(), Vec::new()),
            (Selection::Scalar, _) => {
                anyhow::bail!("Scalar selection needs a vocabulary-reducing metric, got {metric}")
            }
            (_, 1) => anyhow::bail!("Metric {metric} has no vocabulary axis to select from"),
            (Selection::Targets { ids }, _) => gather(row, ids)?,
            (Selection::TopPredictions, _) => {
                let id = *top_predictions.get(pos).ok_or_else(|| {
                    anyhow::anyhow!("No top prediction for position {pos}")
                })?;
                gather(row, &[id])?
            }
            (Selection::TopK { k }, _) => top_k(row, *k, metric),
        };
        out.values.push(values);
        out.indices.push(indices);
    }

    // Rank cells are labeled by the rank itself
    if metric == Metric::Rank {
        out.indices = out
            .values
            .iter()
            .map(|row| row.iter().map(|&v| v as u32).collect())
            .collect();
    }

    Ok(out)
}

/// Rows of a metric tensor with the positions they came from
fn metric_rows(tensor: &Tensor, position: Option<usize>) -> Result<(Vec<usize>, Vec<Vec<f32>>)> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let seq_len = tensor.dim(0)?;
    if let Some(p) = position {
        anyhow::ensure!(p < seq_len, "Position {p} out of range for {seq_len} positions");
    }

    let rows: Vec<Vec<f32>> = match tensor.rank() {
        1 => tensor.to_vec1::<f32>()?.into_iter().map(|v| vec![v]).collect(),
        2 => tensor.to_vec2()?,
        r => anyhow::bail!("Expected a [seq] or [seq, vocab] metric tensor, got rank {r}"),
    };

    Ok(match position {
        Some(p) => (vec![p], vec![rows[p].clone()]),
        None => ((0..seq_len).collect(), rows),
    })
}

fn gather(row: &[f32], ids: &[u32]) -> Result<(Vec<f32>, Vec<u32>)> {
    let values = ids
        .iter()
        .map(|&id| {
            row.get(id as usize).copied().ok_or_else(|| {
                anyhow::anyhow!("Target id {id} out of range for vocabulary of {}", row.len())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((values, ids.to_vec()))
}

/// Best `k` entries; for rank the best entries are the smallest values
fn top_k(row: &[f32], k: usize, metric: Metric) -> (Vec<f32>, Vec<u32>) {
    let order = match metric {
        Metric::Rank => {
            let negated: Vec<f32> = row.iter().map(|v| -v).collect();
            descending_order(&negated)
        }
        Metric::Probability | Metric::Entropy => descending_order(row),
    };
    order
        .into_iter()
        .take(k)
        .map(|i| (row[i], i as u32))
        .unzip()
}
