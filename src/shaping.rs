//! Line and grid shaping of layer-major selections
//!
//! Pure functions: no model or tokenizer access happens here. Callers pass
//! already-decoded labels.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: usize,
    pub y: f32,
}

/// One series across layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub data: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub x: usize,
    pub y: f32,
    pub label: String,
}

/// One grid row: a position (or rank slot) across layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    pub data: Vec<Cell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_axis_label: Option<String>,
}

/// Shaped query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Visualization {
    Lines(Vec<Line>),
    Grid(Vec<Row>),
}

impl Visualization {
    pub fn lines(&self) -> Option<&[Line]> {
        match self {
            Visualization::Lines(lines) => Some(lines),
            Visualization::Grid(_) => None,
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Visualization::Grid(rows) => Some(rows),
            Visualization::Lines(_) => None,
        }
    }
}

/// Swap the outer and inner axes of a rectangular matrix
pub fn transpose<T: Clone>(matrix: &[Vec<T>]) -> Result<Vec<Vec<T>>> {
    let Some(first) = matrix.first() else {
        return Ok(Vec::new());
    };
    let width = first.len();
    if let Some((i, row)) = matrix.iter().enumerate().find(|(_, r)| r.len() != width) {
        anyhow::bail!("Row {i} has {} entries, expected {width}", row.len());
    }

    Ok((0..width)
        .map(|col| matrix.iter().map(|row| row[col].clone()).collect())
        .collect())
}

/// Series id for a decoded token: every whitespace character becomes `_`
pub fn series_id(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Layer-major `[layer][series]` values to one line per series
pub fn shape_lines(values: &[Vec<f32>], labels: &[String]) -> Result<Vec<Line>> {
    let series = transpose(values)?;
    anyhow::ensure!(
        series.len() == labels.len() || values.is_empty(),
        "{} series but {} labels",
        series.len(),
        labels.len()
    );

    Ok(series
        .into_iter()
        .zip(labels)
        .map(|(ys, label)| Line {
            id: series_id(label),
            data: ys
                .into_iter()
                .enumerate()
                .map(|(x, y)| Point { x, y })
                .collect(),
        })
        .collect())
}

/// Layer-major `[layer][row]` values and labels to one grid row per entry
///
/// With `apply_log` the plotted value is `ln(value)` and the label keeps the
/// untransformed value.
pub fn shape_grid(
    values: &[Vec<f32>],
    labels: &[Vec<String>],
    row_ids: &[String],
    right_labels: Option<&[String]>,
    apply_log: bool,
) -> Result<Vec<Row>> {
    let values = transpose(values)?;
    let labels = transpose(labels)?;
    anyhow::ensure!(
        values.len() == labels.len() && values.len() == row_ids.len(),
        "Grid has {} value rows, {} label rows and {} row ids",
        values.len(),
        labels.len(),
        row_ids.len()
    );
    if let Some(right) = right_labels {
        anyhow::ensure!(
            right.len() == row_ids.len(),
            "{} right-axis labels for {} rows",
            right.len(),
            row_ids.len()
        );
    }

    values
        .into_iter()
        .zip(labels)
        .enumerate()
        .map(|(r, (ys, cell_labels))| {
            anyhow::ensure!(ys.len() == cell_labels.len(), "Row {r} has mismatched labels");
            let data = ys
                .into_iter()
                .zip(cell_labels)
                .enumerate()
                .map(|(x, (y, label))| Cell {
                    x,
                    y: if apply_log { y.ln() } else { y },
                    label,
                })
                .collect();
            Ok(Row {
                id: row_ids[r].clone(),
                data,
                right_axis_label: right_labels.map(|right| right[r].clone()),
            })
        })
        .collect()
}
