//! Model tracing capability
//!
//! A [`Tracer`] runs a prompt through a model and exposes every layer's
//! residual stream decoded to vocabulary logits. Implementing this trait is
//! the only requirement for serving a model locally; patching and concept
//! projection are optional and default to an "unsupported" error.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Per-layer decoded logits for one prompt
///
/// Each entry is `[seq_len, vocab]` (a leading batch axis of 1 is stripped
/// on construction). The final entry is the model's output head.
#[derive(Debug, Clone)]
pub struct LayerSeries {
    layers: Vec<Tensor>,
}

impl LayerSeries {
    /// Build a series, stripping a batch axis of size 1 from 3D entries
    pub fn new(layers: Vec<Tensor>) -> Result<Self> {
        anyhow::ensure!(!layers.is_empty(), "Layer series is empty");

        let layers = layers
            .into_iter()
            .map(|t| match t.rank() {
                3 if t.dim(0)? == 1 => Ok(t.squeeze(0)?),
                2 => Ok(t),
                _ => anyhow::bail!(
                    "Expected [seq, vocab] or [1, seq, vocab] layer logits, got {:?}",
                    t.dims()
                ),
            })
            .collect::<Result<Vec<_>>>()?;

        let dims = layers[0].dims().to_vec();
        for (i, layer) in layers.iter().enumerate() {
            anyhow::ensure!(
                layer.dims() == dims.as_slice(),
                "Layer {i} has shape {:?}, expected {:?}",
                layer.dims(),
                dims
            );
        }

        Ok(Self { layers })
    }

    /// Number of entries (layers + output head)
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Tensor] {
        &self.layers
    }

    pub fn get(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(layer)
    }

    /// The model output logits (last entry)
    pub fn output(&self) -> &Tensor {
        &self.layers[self.layers.len() - 1]
    }

    pub fn seq_len(&self) -> usize {
        self.layers[0].dims()[0]
    }

    pub fn vocab_size(&self) -> usize {
        self.layers[0].dims()[1]
    }

    /// Highest-scoring output token at every position
    ///
    /// Ties pick the lower token id, matching rank 1 in [`crate::metrics::rank`].
    pub fn top_predictions(&self) -> Result<Vec<u32>> {
        let rows: Vec<Vec<f32>> = self
            .output()
            .to_dtype(candle_core::DType::F32)?
            .to_vec2()?;
        Ok(rows.iter().map(|row| argmax_first(row)).collect())
    }
}

/// Index of the first maximum in `row`
pub(crate) fn argmax_first(row: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &value) in row.iter().enumerate() {
        if value.total_cmp(&row[best]).is_gt() {
            best = i;
        }
    }
    best as u32
}

/// Output of an activation-patching sweep
#[derive(Debug, Clone)]
pub struct PatchTrace {
    /// One entry per patched layer: output logits of the target prompt
    /// (at least the final position) after patching that layer
    pub series: LayerSeries,
    /// Unpatched top prediction of the source prompt at its last position
    pub source_prediction: u32,
    /// Unpatched top prediction of the target prompt at its last position
    pub target_prediction: u32,
}

/// Attention head whose OV circuit is used by the concept lens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct ConceptHead {
    pub layer: usize,
    pub head: usize,
}

impl From<(usize, usize)> for ConceptHead {
    fn from((layer, head): (usize, usize)) -> Self {
        Self { layer, head }
    }
}

impl From<ConceptHead> for (usize, usize) {
    fn from(h: ConceptHead) -> Self {
        (h.layer, h.head)
    }
}

/// Capability to trace a prompt through a model
pub trait Tracer: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Decode the residual stream after the embedding and after every layer
    ///
    /// Returns `n_layers() + 1` entries; the last one equals the model output.
    fn trace(&self, input_ids: &[u32]) -> Result<LayerSeries>;

    // --- Optional capabilities (default: unsupported) ---

    /// Patch the source residual at `source_position` into the target prompt
    /// at `target_position`, once per layer
    fn trace_patched(
        &self,
        _source_ids: &[u32],
        _source_position: usize,
        _target_ids: &[u32],
        _target_position: usize,
    ) -> Result<PatchTrace> {
        anyhow::bail!("Activation patching not supported for this model")
    }

    /// Project each layer's hidden state at `position` through the summed OV
    /// circuit of `heads`, then decode; entries are `[1, vocab]`
    fn trace_concept(
        &self,
        _input_ids: &[u32],
        _position: usize,
        _heads: &[ConceptHead],
    ) -> Result<LayerSeries> {
        anyhow::bail!("Concept lens not supported for this model")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_series_strips_batch_axis() {
        let t = Tensor::zeros((1, 4, 10), DType::F32, &Device::Cpu).unwrap();
        let series = LayerSeries::new(vec![t.clone(), t]).unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series.seq_len(), 4);
        assert_eq!(series.vocab_size(), 10);
        assert_eq!(series.output().dims(), &[4, 10]);
    }

    #[test]
    fn test_series_rejects_ragged_layers() {
        let a = Tensor::zeros((4, 10), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((4, 11), DType::F32, &Device::Cpu).unwrap();
        assert!(LayerSeries::new(vec![a, b]).is_err());
        assert!(LayerSeries::new(vec![]).is_err());
    }

    #[test]
    fn test_top_predictions_first_max_wins() {
        let out = Tensor::new(&[[0.0f32, 2.0, 2.0], [5.0, 1.0, 0.0]], &Device::Cpu).unwrap();
        let series = LayerSeries::new(vec![out]).unwrap();
        assert_eq!(series.top_predictions().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_concept_head_serde_as_pair() {
        let heads: Vec<ConceptHead> = serde_json::from_str("[[3, 7], [10, 0]]").unwrap();
        assert_eq!(heads[0], ConceptHead { layer: 3, head: 7 });
        assert_eq!(serde_json::to_string(&heads[1]).unwrap(), "[10,0]");
    }
}
