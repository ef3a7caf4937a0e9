//! Turning a raw payload into a visualization
//!
//! [`render`] is the only place shaping is invoked. It decodes the labels a
//! layout needs through the token codec and hands plain values to the pure
//! shapers in [`crate::shaping`].

use anyhow::Result;

use crate::lens::RawPayload;
use crate::metrics::Metric;
use crate::shaping::{shape_grid, shape_lines, Visualization};
use crate::tokenizer::TokenCodec;

/// How a payload is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One line per selected target, x = layer
    Lines,
    /// One row per input position, one cell per layer
    PositionGrid { metric: Metric },
    /// One row per selection slot (`"1"`..`"k"`), one cell per layer
    SlotGrid,
}

/// Shape a raw payload for display
pub fn render(layout: Layout, payload: &RawPayload, codec: &dyn TokenCodec) -> Result<Visualization> {
    match layout {
        Layout::Lines => render_lines(payload, codec),
        Layout::PositionGrid { metric } => render_position_grid(payload, codec, metric),
        Layout::SlotGrid => render_slot_grid(payload, codec),
    }
}

/// First (and only) row of every layer
fn single_row<'a, T>(rows: impl Iterator<Item = &'a Vec<Vec<T>>>) -> Result<Vec<Vec<T>>>
where
    T: Clone + 'a,
{
    rows.enumerate()
        .map(|(layer, rows)| {
            anyhow::ensure!(
                rows.len() == 1,
                "Layer {layer} has {} rows, expected one",
                rows.len()
            );
            Ok(rows[0].clone())
        })
        .collect()
}

fn render_lines(payload: &RawPayload, codec: &dyn TokenCodec) -> Result<Visualization> {
    let values = single_row(payload.layers.iter().map(|l| &l.values))?;
    let labels = codec.decode_each(&payload.targets);
    Ok(Visualization::Lines(shape_lines(&values, &labels)?))
}

fn render_position_grid(
    payload: &RawPayload,
    codec: &dyn TokenCodec,
    metric: Metric,
) -> Result<Visualization> {
    let mut values = Vec::with_capacity(payload.layers.len());
    let mut labels = Vec::with_capacity(payload.layers.len());

    for (layer, selection) in payload.layers.iter().enumerate() {
        anyhow::ensure!(
            selection.values.len() == payload.positions.len(),
            "Layer {layer} has {} rows for {} positions",
            selection.values.len(),
            payload.positions.len()
        );

        let mut layer_values = Vec::with_capacity(selection.values.len());
        let mut layer_labels = Vec::with_capacity(selection.values.len());
        for (row, row_values) in selection.values.iter().enumerate() {
            let value = *row_values
                .first()
                .ok_or_else(|| anyhow::anyhow!("Layer {layer} row {row} is empty"))?;
            let label = match metric {
                Metric::Probability => {
                    let id = selection
                        .indices
                        .get(row)
                        .and_then(|r| r.first())
                        .ok_or_else(|| anyhow::anyhow!("Layer {layer} row {row} has no index"))?;
                    codec.decode(*id)
                }
                Metric::Rank => format!("{}", value as u32),
                Metric::Entropy => format!("{value:.4}"),
            };
            layer_values.push(value);
            layer_labels.push(label);
        }
        values.push(layer_values);
        labels.push(layer_labels);
    }

    let row_ids = payload
        .positions
        .iter()
        .map(|&pos| {
            let id = payload
                .input_ids
                .get(pos)
                .ok_or_else(|| anyhow::anyhow!("Position {pos} beyond the prompt"))?;
            Ok(format!("{}-{pos}", codec.decode(*id)))
        })
        .collect::<Result<Vec<_>>>()?;

    let right_labels = match metric {
        Metric::Rank | Metric::Entropy => Some(
            payload
                .positions
                .iter()
                .map(|&pos| {
                    payload
                        .top_predictions
                        .get(pos)
                        .map(|&id| codec.decode(id))
                        .ok_or_else(|| anyhow::anyhow!("No top prediction for position {pos}"))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        Metric::Probability => None,
    };

    Ok(Visualization::Grid(shape_grid(
        &values,
        &labels,
        &row_ids,
        right_labels.as_deref(),
        metric == Metric::Rank,
    )?))
}

fn render_slot_grid(payload: &RawPayload, codec: &dyn TokenCodec) -> Result<Visualization> {
    let values = single_row(payload.layers.iter().map(|l| &l.values))?;
    let indices = single_row(payload.layers.iter().map(|l| &l.indices))?;
    let labels: Vec<Vec<String>> = indices.iter().map(|ids| codec.decode_each(ids)).collect();
    let slots = values.first().map(Vec::len).unwrap_or(0);
    let row_ids: Vec<String> = (1..=slots).map(|slot| slot.to_string()).collect();

    Ok(Visualization::Grid(shape_grid(
        &values, &labels, &row_ids, None, false,
    )?))
}
