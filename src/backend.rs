//! Job/backend abstraction
//!
//! Queries run under one of two execution modes. Local execution computes in
//! process and returns shaped data from the start call. Remote execution
//! submits a [`JobSpec`] to a [`RemoteExecutor`], returns the job id, and a
//! later collect call fetches the raw payload by that id.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lens::{JobSpec, RawPayload};
use crate::shaping::Visualization;

/// Opaque, executor-issued job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random (UUID v4) id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

/// Execution mode named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Local,
    Remote,
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ExecutionMode::Local),
            "remote" => Ok(ExecutionMode::Remote),
            other => anyhow::bail!("Unknown execution mode '{other}' (expected local or remote)"),
        }
    }
}

/// Executor that computes jobs out of band
///
/// `submit` must not wait for the computation. `collect` waits until the job
/// is finished and returns its payload, or the failure message.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn submit(&self, spec: JobSpec) -> Result<JobId>;

    async fn status(&self, job_id: &JobId) -> Result<JobStatus>;

    async fn collect(&self, job_id: &JobId) -> Result<RawPayload>;
}

/// Where query computation happens
#[derive(Clone)]
pub enum Execution {
    /// Compute in process on a blocking thread
    Local,
    /// Hand jobs to a remote executor
    Remote(Arc<dyn RemoteExecutor>),
}

impl Execution {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Execution::Local => ExecutionMode::Local,
            Execution::Remote(_) => ExecutionMode::Remote,
        }
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Local => f.write_str("Local"),
            Execution::Remote(_) => f.write_str("Remote(..)"),
        }
    }
}

/// Result of starting a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryStart {
    /// Local mode: the shaped result
    Complete { data: Visualization },
    /// Remote mode: collect later with this id
    Pending { job_id: JobId },
}

impl QueryStart {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueryStart::Pending { job_id } => Some(job_id),
            QueryStart::Complete { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<Visualization> {
        match self {
            QueryStart::Complete { data } => Some(data),
            QueryStart::Pending { .. } => None,
        }
    }
}
