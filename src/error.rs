//! Error taxonomy for lensbench queries
//!
//! Capability seams (tracing, tokenization, numeric stages) return
//! `anyhow::Result`. Everything crossing the public query boundary is a
//! [`WorkbenchError`], which names the failing stage and always carries a
//! human-readable cause.

use std::fmt;

use crate::backend::JobId;

/// Result type alias for query operations
pub type Result<T> = std::result::Result<T, WorkbenchError>;

/// Pipeline stage in which a compute failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Prompt encoding or token decoding
    Tokenize,
    /// Model trace (forward pass and per-layer decoding)
    Trace,
    /// Probability / rank / entropy computation
    Metric,
    /// Target-id or top-k selection
    Selection,
    /// Line or grid shaping
    Shaping,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Tokenize => "tokenize",
            Stage::Trace => "trace",
            Stage::Metric => "metric",
            Stage::Selection => "selection",
            Stage::Shaping => "shaping",
        };
        f.write_str(name)
    }
}

/// Unified error type for the query pipeline
#[derive(Debug, thiserror::Error)]
pub enum WorkbenchError {
    /// Malformed request, rejected before any model work
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Gated model requested without a caller identity
    #[error("Access denied: model '{model}' requires a signed-in caller")]
    AccessDenied { model: String },

    /// Model is not currently loaded
    #[error("Model unavailable: '{0}' is not currently loaded")]
    ModelUnavailable(String),

    /// Failure inside trace / metric / selection / shaping
    #[error("Compute error during {stage}: {source:#}")]
    Compute {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// Remote submission or collection failure
    #[error("Backend error{}: {message}", job_suffix(.job_id))]
    Backend {
        job_id: Option<JobId>,
        message: String,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

fn job_suffix(job_id: &Option<JobId>) -> String {
    match job_id {
        Some(id) => format!(" (job {id})"),
        None => String::new(),
    }
}

impl WorkbenchError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a compute error for the given stage
    pub fn compute(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self::Compute {
            stage,
            source: source.into(),
        }
    }

    /// Create a backend error, optionally tied to a job
    pub fn backend(job_id: Option<&JobId>, msg: impl Into<String>) -> Self {
        Self::Backend {
            job_id: job_id.cloned(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Job this error belongs to, if known
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Backend { job_id, .. } => job_id.as_ref(),
            _ => None,
        }
    }

    /// Stage of a compute failure
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Compute { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Error category for logging and telemetry
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AccessDenied { .. } => "access_denied",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::Compute { .. } => "compute",
            Self::Backend { .. } => "backend",
            Self::Config(_) => "config",
        }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_) | Self::Backend { .. })
    }

    /// HTTP status a thin request layer should answer with
    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::AccessDenied { .. } => 403,
            Self::ModelUnavailable(_) => 503,
            Self::Backend { .. } => 502,
            Self::Compute { .. } | Self::Config(_) => 500,
        }
    }
}

/// Extension trait tagging `anyhow` failures with the stage they came from
pub trait StageContext<T> {
    /// Convert the error into [`WorkbenchError::Compute`] for `stage`
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| WorkbenchError::compute(stage, e))
    }
}
