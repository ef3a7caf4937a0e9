//! Query computation: trace, metric, selection
//!
//! [`execute`] runs a [`Task`] against a loaded model and produces the raw
//! [`RawPayload`] that a remote executor would return. It is synchronous and
//! may block for the length of a forward pass; async callers run it on a
//! blocking thread.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, Stage, StageContext, WorkbenchError};
use crate::metrics::Metric;
use crate::selection::{select, LayerSelection, Selection, TokenPosition};
use crate::tokenizer::TokenCodec;
use crate::tracer::{ConceptHead, LayerSeries, Tracer};

/// Serializable job description handed to an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub model: String,
    pub task: Task,
}

/// Everything needed to compute one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "kebab-case")]
pub enum Task {
    LogitLens {
        prompt: String,
        metric: Metric,
        position: Option<TokenPosition>,
        selection: Selection,
    },
    ActivationPatching {
        src_prompt: String,
        src_position: TokenPosition,
        tgt_prompt: String,
        tgt_position: TokenPosition,
        metric: Metric,
        target_ids: Option<Vec<u32>>,
    },
    ConceptLens {
        prompt: String,
        position: TokenPosition,
        selection: Selection,
        heads: Vec<ConceptHead>,
    },
}

/// Raw selection result of one job, shaped later by the caller
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPayload {
    /// Encoded prompt (the target prompt for activation patching)
    pub input_ids: Vec<u32>,
    /// Positions covered by each layer's rows, in row order
    pub positions: Vec<usize>,
    /// Target ids selected at every layer (empty for top-k and scalar selections)
    pub targets: Vec<u32>,
    /// Final-layer top prediction per input position; for activation patching,
    /// the unpatched source and target predictions
    pub top_predictions: Vec<u32>,
    /// One selection per layer
    pub layers: Vec<LayerSelection>,
}

/// Run `task` on a loaded model
pub fn execute(tracer: &dyn Tracer, codec: &dyn TokenCodec, task: &Task) -> Result<RawPayload> {
    match task {
        Task::LogitLens {
            prompt,
            metric,
            position,
            selection,
        } => logit_lens(tracer, codec, prompt, *metric, *position, selection),
        Task::ActivationPatching {
            src_prompt,
            src_position,
            tgt_prompt,
            tgt_position,
            metric,
            target_ids,
        } => activation_patching(
            tracer,
            codec,
            (src_prompt, *src_position),
            (tgt_prompt, *tgt_position),
            *metric,
            target_ids.as_deref(),
        ),
        Task::ConceptLens {
            prompt,
            position,
            selection,
            heads,
        } => concept_lens(tracer, codec, prompt, *position, selection, heads),
    }
}

fn encode(codec: &dyn TokenCodec, prompt: &str) -> Result<Vec<u32>> {
    let ids = codec.encode(prompt).stage(Stage::Tokenize)?;
    if ids.is_empty() {
        return Err(WorkbenchError::compute(
            Stage::Tokenize,
            anyhow::anyhow!("prompt encoded to zero tokens"),
        ));
    }
    Ok(ids)
}

fn resolve_position(position: TokenPosition, seq_len: usize) -> Result<usize> {
    position
        .resolve(seq_len)
        .map_err(|e| WorkbenchError::validation(e.to_string()))
}

fn check_vocab(ids: &[u32], vocab_size: usize) -> Result<()> {
    match ids.iter().find(|&&id| id as usize >= vocab_size) {
        Some(id) => Err(WorkbenchError::validation(format!(
            "target id {id} is outside the vocabulary of {vocab_size} tokens"
        ))),
        None => Ok(()),
    }
}

fn apply_metric(series: &LayerSeries, metric: Metric) -> Result<Vec<candle_core::Tensor>> {
    series
        .layers()
        .iter()
        .map(|layer| metric.apply(layer))
        .collect::<anyhow::Result<Vec<_>>>()
        .stage(Stage::Metric)
}

fn logit_lens(
    tracer: &dyn Tracer,
    codec: &dyn TokenCodec,
    prompt: &str,
    metric: Metric,
    position: Option<TokenPosition>,
    selection: &Selection,
) -> Result<RawPayload> {
    let input_ids = encode(codec, prompt)?;
    let position = position
        .map(|p| resolve_position(p, input_ids.len()))
        .transpose()?;
    if let Selection::Targets { ids } = selection {
        check_vocab(ids, tracer.vocab_size())?;
    }

    let series = tracer.trace(&input_ids).stage(Stage::Trace)?;
    debug!(
        "Traced {} tokens through {} layer entries",
        input_ids.len(),
        series.len()
    );
    let top_predictions = series.top_predictions().stage(Stage::Metric)?;
    let metric_layers = apply_metric(&series, metric)?;
    let layers = select(&metric_layers, metric, position, selection, &top_predictions)
        .stage(Stage::Selection)?;

    Ok(RawPayload {
        positions: match position {
            Some(p) => vec![p],
            None => (0..input_ids.len()).collect(),
        },
        targets: selected_targets(selection),
        input_ids,
        top_predictions,
        layers,
    })
}

fn activation_patching(
    tracer: &dyn Tracer,
    codec: &dyn TokenCodec,
    (src_prompt, src_position): (&str, TokenPosition),
    (tgt_prompt, tgt_position): (&str, TokenPosition),
    metric: Metric,
    target_ids: Option<&[u32]>,
) -> Result<RawPayload> {
    let src_ids = encode(codec, src_prompt)?;
    let tgt_ids = encode(codec, tgt_prompt)?;
    let src_pos = resolve_position(src_position, src_ids.len())?;
    let tgt_pos = resolve_position(tgt_position, tgt_ids.len())?;
    if let Some(ids) = target_ids {
        check_vocab(ids, tracer.vocab_size())?;
    }

    let patch = tracer
        .trace_patched(&src_ids, src_pos, &tgt_ids, tgt_pos)
        .stage(Stage::Trace)?;
    debug!(
        "Patched {} layers (source predicts {}, target predicts {})",
        patch.series.len(),
        patch.source_prediction,
        patch.target_prediction
    );

    let targets = match target_ids {
        Some(ids) => ids.to_vec(),
        None => vec![patch.source_prediction, patch.target_prediction],
    };
    let last = patch.series.seq_len() - 1;
    let metric_layers = apply_metric(&patch.series, metric)?;
    let selection = Selection::Targets {
        ids: targets.clone(),
    };
    let layers =
        select(&metric_layers, metric, Some(last), &selection, &[]).stage(Stage::Selection)?;

    Ok(RawPayload {
        positions: vec![tgt_ids.len() - 1],
        input_ids: tgt_ids,
        targets,
        top_predictions: vec![patch.source_prediction, patch.target_prediction],
        layers,
    })
}

fn concept_lens(
    tracer: &dyn Tracer,
    codec: &dyn TokenCodec,
    prompt: &str,
    position: TokenPosition,
    selection: &Selection,
    heads: &[ConceptHead],
) -> Result<RawPayload> {
    let input_ids = encode(codec, prompt)?;
    let pos = resolve_position(position, input_ids.len())?;
    if let Selection::Targets { ids } = selection {
        check_vocab(ids, tracer.vocab_size())?;
    }
    if let Some(head) = heads.iter().find(|h| h.layer >= tracer.n_layers()) {
        return Err(WorkbenchError::validation(format!(
            "concept head ({}, {}) names a layer beyond the model's {}",
            head.layer,
            head.head,
            tracer.n_layers()
        )));
    }

    let series = tracer
        .trace_concept(&input_ids, pos, heads)
        .stage(Stage::Trace)?;
    let metric_layers = apply_metric(&series, Metric::Probability)?;
    let layers = select(&metric_layers, Metric::Probability, Some(0), selection, &[])
        .stage(Stage::Selection)?;

    Ok(RawPayload {
        input_ids,
        positions: vec![pos],
        targets: selected_targets(selection),
        top_predictions: Vec::new(),
        layers,
    })
}

fn selected_targets(selection: &Selection) -> Vec<u32> {
    match selection {
        Selection::Targets { ids } => ids.clone(),
        Selection::TopPredictions | Selection::TopK { .. } | Selection::Scalar => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedTracer, WordCodec};

    fn codec() -> WordCodec {
        WordCodec::new(["<s>", "The", "cat", "sat", "on", "the", "mat"])
    }

    #[test]
    fn test_logit_lens_targets_at_last_position() {
        let tracer = ScriptedTracer::new(2, 7);
        let task = Task::LogitLens {
            prompt: "The cat".into(),
            metric: Metric::Probability,
            position: Some(TokenPosition::LAST),
            selection: Selection::Targets { ids: vec![3, 4] },
        };
        let payload = execute(&tracer, &codec(), &task).unwrap();

        assert_eq!(payload.input_ids, vec![0, 1, 2]);
        assert_eq!(payload.positions, vec![2]);
        assert_eq!(payload.targets, vec![3, 4]);
        assert_eq!(payload.layers.len(), 3);
        for layer in &payload.layers {
            assert_eq!(layer.indices, vec![vec![3, 4]]);
        }
        assert_eq!(tracer.trace_calls(), 1);
    }

    #[test]
    fn test_logit_lens_grid_rank_tracks_top_predictions() {
        let tracer = ScriptedTracer::new(3, 7);
        let task = Task::LogitLens {
            prompt: "The cat sat".into(),
            metric: Metric::Rank,
            position: None,
            selection: Selection::TopPredictions,
        };
        let payload = execute(&tracer, &codec(), &task).unwrap();

        assert_eq!(payload.positions, vec![0, 1, 2, 3]);
        assert_eq!(payload.top_predictions.len(), 4);
        // Final layer ranks its own top prediction first
        let last = payload.layers.last().unwrap();
        assert!(last.values.iter().all(|row| row == &vec![1.0]));
        assert_eq!(last.indices, last.values.iter().map(|r| vec![r[0] as u32]).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_vocab_target_is_validation() {
        let tracer = ScriptedTracer::new(2, 7);
        let task = Task::LogitLens {
            prompt: "The".into(),
            metric: Metric::Probability,
            position: None,
            selection: Selection::Targets { ids: vec![99] },
        };
        let err = execute(&tracer, &codec(), &task).unwrap_err();
        assert!(matches!(err, WorkbenchError::Validation(_)));
        assert_eq!(tracer.trace_calls(), 0);
    }

    #[test]
    fn test_position_out_of_range_is_validation() {
        let tracer = ScriptedTracer::new(2, 7);
        let task = Task::LogitLens {
            prompt: "The".into(),
            metric: Metric::Entropy,
            position: Some(TokenPosition::Index(5)),
            selection: Selection::Scalar,
        };
        assert!(matches!(
            execute(&tracer, &codec(), &task),
            Err(WorkbenchError::Validation(_))
        ));
    }

    #[test]
    fn test_patching_defaults_to_source_and_target_predictions() {
        let tracer = ScriptedTracer::new(4, 7);
        let task = Task::ActivationPatching {
            src_prompt: "The cat".into(),
            src_position: TokenPosition::LAST,
            tgt_prompt: "the mat".into(),
            tgt_position: TokenPosition::LAST,
            metric: Metric::Probability,
            target_ids: None,
        };
        let payload = execute(&tracer, &codec(), &task).unwrap();

        assert_eq!(payload.layers.len(), 4);
        assert_eq!(payload.targets, payload.top_predictions);
        assert_eq!(payload.targets.len(), 2);
        assert_eq!(payload.positions, vec![2]);
    }

    #[test]
    fn test_concept_lens_top_k_slots() {
        let tracer = ScriptedTracer::new(3, 7);
        let task = Task::ConceptLens {
            prompt: "The cat".into(),
            position: TokenPosition::LAST,
            selection: Selection::TopK { k: 2 },
            heads: vec![ConceptHead { layer: 0, head: 1 }],
        };
        let payload = execute(&tracer, &codec(), &task).unwrap();

        assert_eq!(payload.layers.len(), 3);
        assert!(payload.layers.iter().all(|l| l.values[0].len() == 2));
    }

    #[test]
    fn test_concept_head_beyond_model_is_rejected() {
        let tracer = ScriptedTracer::new(3, 7);
        let task = Task::ConceptLens {
            prompt: "The cat".into(),
            position: TokenPosition::LAST,
            selection: Selection::TopK { k: 2 },
            heads: vec![ConceptHead { layer: 3, head: 0 }],
        };
        assert!(matches!(
            execute(&tracer, &codec(), &task),
            Err(WorkbenchError::Validation(_))
        ));
    }

    #[test]
    fn test_unsupported_capability_is_trace_error() {
        let tracer = ScriptedTracer::new(2, 7).without_interventions();
        let task = Task::ActivationPatching {
            src_prompt: "The".into(),
            src_position: TokenPosition::LAST,
            tgt_prompt: "cat".into(),
            tgt_position: TokenPosition::LAST,
            metric: Metric::Rank,
            target_ids: Some(vec![1]),
        };
        let err = execute(&tracer, &codec(), &task).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Trace));
        assert!(err.to_string().contains("not supported"));
    }
}
