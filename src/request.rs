//! Query requests and their execution plans
//!
//! A [`QueryRequest`] is what a client sends. Validation happens here, before
//! any model work, and [`QueryRequest::plan`] turns a valid request into the
//! serializable [`JobSpec`] handed to an executor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkbenchError};
use crate::lens::{JobSpec, Task};
use crate::metrics::Metric;
use crate::render::Layout;
use crate::selection::{Selection, TokenPosition};
use crate::tracer::ConceptHead;

/// Default number of concept-lens rank slots
pub const DEFAULT_CONCEPT_TOP_K: usize = 5;

/// Introspection tool named by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    LogitLens,
    ActivationPatching,
    ConceptLens,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::LogitLens => "logit-lens",
            Tool::ActivationPatching => "activation-patching",
            Tool::ConceptLens => "concept-lens",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logit lens output orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// One series per target id across layers
    Line,
    /// One row per input position, one cell per layer
    Grid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensRequest {
    pub model: String,
    pub prompt: String,
    pub metric: Metric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_position: Option<TokenPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    pub view: View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub model: String,
    pub src_prompt: String,
    pub src_position: TokenPosition,
    pub tgt_prompt: String,
    pub tgt_position: TokenPosition,
    pub metric: Metric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptRequest {
    pub model: String,
    pub prompt: String,
    pub token_position: TokenPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

/// A client query, tagged by tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "kebab-case")]
pub enum QueryRequest {
    LogitLens(LensRequest),
    ActivationPatching(PatchRequest),
    ConceptLens(ConceptRequest),
}

impl QueryRequest {
    pub fn model(&self) -> &str {
        match self {
            QueryRequest::LogitLens(r) => &r.model,
            QueryRequest::ActivationPatching(r) => &r.model,
            QueryRequest::ConceptLens(r) => &r.model,
        }
    }

    pub fn tool(&self) -> Tool {
        match self {
            QueryRequest::LogitLens(_) => Tool::LogitLens,
            QueryRequest::ActivationPatching(_) => Tool::ActivationPatching,
            QueryRequest::ConceptLens(_) => Tool::ConceptLens,
        }
    }

    pub fn metric(&self) -> Metric {
        match self {
            QueryRequest::LogitLens(r) => r.metric,
            QueryRequest::ActivationPatching(r) => r.metric,
            QueryRequest::ConceptLens(_) => Metric::Probability,
        }
    }

    /// How the raw payload of this request is shaped
    pub fn layout(&self) -> Layout {
        match self {
            QueryRequest::LogitLens(r) => match r.view {
                View::Line => Layout::Lines,
                View::Grid => Layout::PositionGrid { metric: r.metric },
            },
            QueryRequest::ActivationPatching(_) => Layout::Lines,
            QueryRequest::ConceptLens(_) => Layout::SlotGrid,
        }
    }

    /// Reject malformed requests before any model work
    pub fn validate(&self) -> Result<()> {
        if self.model().trim().is_empty() {
            return Err(WorkbenchError::validation("model name is empty"));
        }
        match self {
            QueryRequest::LogitLens(r) => r.validate(),
            QueryRequest::ActivationPatching(r) => r.validate(),
            QueryRequest::ConceptLens(r) => r.validate(),
        }
    }

    /// Build the job description for a validated request
    ///
    /// Concept-lens requests need the model's concept heads; every other
    /// tool ignores `concept_heads`.
    pub fn plan(&self, concept_heads: Option<Vec<ConceptHead>>) -> Result<JobSpec> {
        let task = match self {
            QueryRequest::LogitLens(r) => r.task(),
            QueryRequest::ActivationPatching(r) => Task::ActivationPatching {
                src_prompt: r.src_prompt.clone(),
                src_position: r.src_position,
                tgt_prompt: r.tgt_prompt.clone(),
                tgt_position: r.tgt_position,
                metric: r.metric,
                target_ids: r.target_ids.clone(),
            },
            QueryRequest::ConceptLens(r) => {
                let heads = concept_heads
                    .filter(|heads| !heads.is_empty())
                    .ok_or_else(|| {
                        WorkbenchError::validation(format!(
                            "model '{}' has no concept-head data",
                            r.model
                        ))
                    })?;
                r.task(heads)
            }
        };

        Ok(JobSpec {
            model: self.model().to_string(),
            task,
        })
    }
}

fn require_prompt(field: &str, prompt: &str) -> Result<()> {
    if prompt.is_empty() {
        return Err(WorkbenchError::validation(format!("{field} is empty")));
    }
    Ok(())
}

fn require_targets(target_ids: &Option<Vec<u32>>) -> Result<()> {
    if matches!(target_ids, Some(ids) if ids.is_empty()) {
        return Err(WorkbenchError::validation("targetIds is empty"));
    }
    Ok(())
}

impl LensRequest {
    fn validate(&self) -> Result<()> {
        require_prompt("prompt", &self.prompt)?;
        require_targets(&self.target_ids)?;

        if self.metric == Metric::Entropy && self.target_ids.is_some() {
            return Err(WorkbenchError::validation(
                "entropy is a per-position scalar and takes no targetIds",
            ));
        }

        match self.view {
            View::Line => {
                if self.metric == Metric::Entropy {
                    return Err(WorkbenchError::validation(
                        "line view needs target ids, which entropy does not have",
                    ));
                }
                if self.target_ids.is_none() {
                    return Err(WorkbenchError::validation("line view requires targetIds"));
                }
            }
            View::Grid => {
                if matches!(&self.target_ids, Some(ids) if ids.len() > 1) {
                    return Err(WorkbenchError::validation(
                        "grid view shows one value per cell; pass at most one target id",
                    ));
                }
                let top_k = self.top_k.unwrap_or(self.metric.default_top_k());
                let expected = self.metric.default_top_k();
                if self.target_ids.is_none() && top_k != expected {
                    return Err(WorkbenchError::validation(format!(
                        "grid view with {} requires topK = {expected}, got {top_k}",
                        self.metric
                    )));
                }
            }
        }
        Ok(())
    }

    fn task(&self) -> Task {
        let (position, selection) = match self.view {
            View::Line => (
                Some(self.token_position.unwrap_or(TokenPosition::LAST)),
                Selection::Targets {
                    ids: self.target_ids.clone().unwrap_or_default(),
                },
            ),
            View::Grid => {
                let selection = match (&self.target_ids, self.metric) {
                    (_, Metric::Entropy) => Selection::Scalar,
                    (Some(ids), _) => Selection::Targets { ids: ids.clone() },
                    (None, Metric::Rank) => Selection::TopPredictions,
                    (None, Metric::Probability) => Selection::TopK { k: 1 },
                };
                (self.token_position, selection)
            }
        };

        Task::LogitLens {
            prompt: self.prompt.clone(),
            metric: self.metric,
            position,
            selection,
        }
    }
}

impl PatchRequest {
    fn validate(&self) -> Result<()> {
        require_prompt("srcPrompt", &self.src_prompt)?;
        require_prompt("tgtPrompt", &self.tgt_prompt)?;
        require_targets(&self.target_ids)?;
        if self.metric == Metric::Entropy {
            return Err(WorkbenchError::validation(
                "activation patching plots target ids, which entropy does not have",
            ));
        }
        Ok(())
    }
}

impl ConceptRequest {
    fn validate(&self) -> Result<()> {
        require_prompt("prompt", &self.prompt)?;
        require_targets(&self.target_ids)?;
        if self.top_k == Some(0) {
            return Err(WorkbenchError::validation("concept lens needs topK >= 1"));
        }
        Ok(())
    }

    fn task(&self, heads: Vec<ConceptHead>) -> Task {
        let selection = match &self.target_ids {
            Some(ids) => Selection::Targets { ids: ids.clone() },
            None => Selection::TopK {
                k: self.top_k.unwrap_or(DEFAULT_CONCEPT_TOP_K),
            },
        };
        Task::ConceptLens {
            prompt: self.prompt.clone(),
            position: self.token_position,
            selection,
            heads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(metric: Metric, view: View) -> LensRequest {
        LensRequest {
            model: "tiny".into(),
            prompt: "The cat".into(),
            metric,
            token_position: None,
            target_ids: None,
            top_k: None,
            view,
        }
    }

    #[test]
    fn test_parse_tagged_request() {
        let json = r#"{
            "tool": "logit-lens",
            "model": "tiny",
            "prompt": "The cat",
            "metric": "probability",
            "tokenPosition": "last",
            "targetIds": [10, 20],
            "view": "line"
        }"#;
        let req: QueryRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.tool(), Tool::LogitLens);
        assert_eq!(req.model(), "tiny");
        let QueryRequest::LogitLens(r) = &req else {
            panic!("expected logit lens");
        };
        assert_eq!(r.target_ids, Some(vec![10, 20]));
        assert_eq!(r.token_position, Some(TokenPosition::LAST));
        req.validate().unwrap();
    }

    #[test]
    fn test_parse_patch_request() {
        let json = r#"{
            "tool": "activation-patching",
            "model": "tiny",
            "srcPrompt": "Paris is in",
            "srcPosition": -1,
            "tgtPrompt": "Rome is in",
            "tgtPosition": 0,
            "metric": "rank"
        }"#;
        let req: QueryRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.tool(), Tool::ActivationPatching);
        assert_eq!(req.metric(), Metric::Rank);
        req.validate().unwrap();
    }

    #[test]
    fn test_line_view_rules() {
        let mut r = lens(Metric::Probability, View::Line);
        assert!(QueryRequest::LogitLens(r.clone()).validate().is_err());

        r.target_ids = Some(vec![]);
        assert!(QueryRequest::LogitLens(r.clone()).validate().is_err());

        r.target_ids = Some(vec![1, 2]);
        QueryRequest::LogitLens(r.clone()).validate().unwrap();

        r.metric = Metric::Entropy;
        let err = QueryRequest::LogitLens(r).validate().unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_grid_view_top_k() {
        let mut r = lens(Metric::Probability, View::Grid);
        QueryRequest::LogitLens(r.clone()).validate().unwrap();

        r.top_k = Some(3);
        assert!(QueryRequest::LogitLens(r.clone()).validate().is_err());

        r.metric = Metric::Entropy;
        r.top_k = None;
        QueryRequest::LogitLens(r).validate().unwrap();
    }

    #[test]
    fn test_grid_plan_selection() {
        let plan = |metric| {
            let spec = QueryRequest::LogitLens(lens(metric, View::Grid)).plan(None).unwrap();
            match spec.task {
                Task::LogitLens { selection, position, .. } => (selection, position),
                other => panic!("unexpected task {other:?}"),
            }
        };

        assert_eq!(plan(Metric::Probability), (Selection::TopK { k: 1 }, None));
        assert_eq!(plan(Metric::Rank).0, Selection::TopPredictions);
        assert_eq!(plan(Metric::Entropy).0, Selection::Scalar);
    }

    #[test]
    fn test_line_plan_defaults_to_last_position() {
        let mut r = lens(Metric::Rank, View::Line);
        r.target_ids = Some(vec![7]);
        let spec = QueryRequest::LogitLens(r).plan(None).unwrap();
        let Task::LogitLens { position, selection, .. } = spec.task else {
            panic!("expected logit lens task");
        };
        assert_eq!(position, Some(TokenPosition::LAST));
        assert_eq!(selection, Selection::Targets { ids: vec![7] });
    }

    #[test]
    fn test_concept_plan_requires_heads() {
        let req = QueryRequest::ConceptLens(ConceptRequest {
            model: "tiny".into(),
            prompt: "The cat".into(),
            token_position: TokenPosition::LAST,
            target_ids: None,
            top_k: None,
        });
        req.validate().unwrap();

        let err = req.plan(None).unwrap_err();
        assert!(matches!(err, WorkbenchError::Validation(_)));

        let spec = req.plan(Some(vec![ConceptHead { layer: 1, head: 0 }])).unwrap();
        let Task::ConceptLens { selection, heads, .. } = spec.task else {
            panic!("expected concept lens task");
        };
        assert_eq!(selection, Selection::TopK { k: DEFAULT_CONCEPT_TOP_K });
        assert_eq!(heads.len(), 1);
        assert_eq!(req.layout(), Layout::SlotGrid);
    }

    #[test]
    fn test_patch_rejects_entropy() {
        let req = QueryRequest::ActivationPatching(PatchRequest {
            model: "tiny".into(),
            src_prompt: "a".into(),
            src_position: TokenPosition::LAST,
            tgt_prompt: "b".into(),
            tgt_position: TokenPosition::LAST,
            metric: Metric::Entropy,
            target_ids: None,
        });
        assert!(req.validate().is_err());
    }
}
