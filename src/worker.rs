//! In-process remote executor
//!
//! [`WorkerPool`] plays the remote side of the job protocol inside this
//! process: it serves its own models, runs every submitted job on a spawned
//! task, and hands results back by job id. Job state lives in a
//! `tokio::sync::watch` channel per job so `collect` can await completion.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{JobId, JobStatus, RemoteExecutor};
use crate::lens::{execute, JobSpec, RawPayload};
use crate::registry::{FleetModel, FleetSource, FleetStatus};
use crate::tokenizer::TokenCodec;
use crate::tracer::Tracer;

#[derive(Debug, Clone)]
enum JobState {
    Submitted,
    Running,
    Complete(Arc<RawPayload>),
    Failed(String),
}

impl JobState {
    fn status(&self) -> JobStatus {
        match self {
            JobState::Submitted => JobStatus::Submitted,
            JobState::Running => JobStatus::Running,
            JobState::Complete(_) => JobStatus::Complete,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }
}

struct ServedModel {
    tracer: Arc<dyn Tracer>,
    codec: Arc<dyn TokenCodec>,
    info: FleetModel,
}

struct Inner {
    models: RwLock<HashMap<String, ServedModel>>,
    jobs: RwLock<HashMap<JobId, watch::Receiver<JobState>>>,
    finished: Mutex<VecDeque<JobId>>,
    max_retained: usize,
}

/// Job executor backed by in-process models
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Create a pool that keeps at most `max_retained` finished jobs
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                models: RwLock::new(HashMap::new()),
                jobs: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                max_retained: max_retained.max(1),
            }),
        }
    }

    /// Start serving a model; it shows up as hot in fleet status
    pub async fn serve(
        &self,
        name: &str,
        tracer: Arc<dyn Tracer>,
        codec: Arc<dyn TokenCodec>,
        info: FleetModel,
    ) {
        info!("Worker serving model: {}", name);
        let info = FleetModel { hot: true, ..info };
        self.inner
            .models
            .write()
            .await
            .insert(name.to_string(), ServedModel { tracer, codec, info });
    }

    /// Stop serving a model; running jobs keep their handles
    pub async fn unserve(&self, name: &str) -> bool {
        self.inner.models.write().await.remove(name).is_some()
    }

    /// Number of jobs currently tracked (pending or retained)
    pub async fn tracked_jobs(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    async fn receiver(&self, job_id: &JobId) -> Result<watch::Receiver<JobState>> {
        self.inner
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown job {job_id}"))
    }
}

impl Inner {
    /// Record a finished job and evict the oldest beyond the retention bound
    async fn retire(&self, job_id: JobId) {
        let evicted: Vec<JobId> = {
            let mut finished = self.finished.lock().await;
            finished.push_back(job_id);
            let excess = finished.len().saturating_sub(self.max_retained);
            finished.drain(..excess).collect()
        };
        if !evicted.is_empty() {
            let mut jobs = self.jobs.write().await;
            for id in &evicted {
                jobs.remove(id);
            }
            debug!("Evicted {} finished jobs", evicted.len());
        }
    }
}

#[async_trait]
impl RemoteExecutor for WorkerPool {
    async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let (tracer, codec) = {
            let models = self.inner.models.read().await;
            let served = models
                .get(&spec.model)
                .ok_or_else(|| anyhow::anyhow!("Model '{}' is not served", spec.model))?;
            (served.tracer.clone(), served.codec.clone())
        };

        let job_id = JobId::generate();
        let (tx, rx) = watch::channel(JobState::Submitted);
        self.inner.jobs.write().await.insert(job_id.clone(), rx);
        debug!("Job {} submitted for {}", job_id, spec.model);

        let inner = self.inner.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            tx.send_replace(JobState::Running);
            let outcome = tokio::task::spawn_blocking(move || {
                execute(tracer.as_ref(), codec.as_ref(), &spec.task)
            })
            .await;

            let state = match outcome {
                Ok(Ok(payload)) => JobState::Complete(Arc::new(payload)),
                Ok(Err(e)) => JobState::Failed(e.to_string()),
                Err(e) => JobState::Failed(format!("job task failed: {e}")),
            };
            if let JobState::Failed(message) = &state {
                warn!("Job {} failed: {}", id, message);
            }
            tx.send_replace(state);
            inner.retire(id).await;
        });

        Ok(job_id)
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        let rx = self.receiver(job_id).await?;
        let status = rx.borrow().status();
        Ok(status)
    }

    /// Wait for the job and return its payload
    ///
    /// Finished jobs stay collectable until evicted, so repeated collection
    /// returns the same payload.
    async fn collect(&self, job_id: &JobId) -> Result<RawPayload> {
        let mut rx = self.receiver(job_id).await?;
        let state = rx
            .wait_for(|state| state.status().is_terminal())
            .await
            .map_err(|_| anyhow::anyhow!("Job {job_id} was dropped before finishing"))?
            .clone();

        match state {
            JobState::Complete(payload) => Ok(payload.as_ref().clone()),
            JobState::Failed(message) => anyhow::bail!("{message}"),
            JobState::Submitted | JobState::Running => {
                anyhow::bail!("Job {job_id} finished without a result")
            }
        }
    }
}

#[async_trait]
impl FleetSource for WorkerPool {
    async fn fleet_status(&self) -> Result<FleetStatus> {
        Ok(self
            .inner
            .models
            .read()
            .await
            .iter()
            .map(|(name, served)| (name.clone(), served.info.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::Task;
    use crate::metrics::Metric;
    use crate::mock::{ScriptedTracer, WordCodec};
    use crate::selection::{Selection, TokenPosition};

    async fn pool(max_retained: usize) -> WorkerPool {
        let pool = WorkerPool::new(max_retained);
        pool.serve(
            "tiny",
            Arc::new(ScriptedTracer::new(2, 5)),
            Arc::new(WordCodec::new(["<s>", "a", "b", "c", "d"])),
            FleetModel {
                n_layers: 2,
                ..FleetModel::default()
            },
        )
        .await;
        pool
    }

    fn spec(prompt: &str) -> JobSpec {
        JobSpec {
            model: "tiny".into(),
            task: Task::LogitLens {
                prompt: prompt.into(),
                metric: Metric::Probability,
                position: Some(TokenPosition::LAST),
                selection: Selection::Targets { ids: vec![1, 2] },
            },
        }
    }

    #[tokio::test]
    async fn test_submit_then_collect() {
        let pool = pool(8).await;
        let job = pool.submit(spec("a b")).await.unwrap();

        let payload = pool.collect(&job).await.unwrap();
        assert_eq!(payload.input_ids, vec![0, 1, 2]);
        assert_eq!(payload.layers.len(), 3);
        assert_eq!(pool.status(&job).await.unwrap(), JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_collect_is_idempotent() {
        let pool = pool(8).await;
        let job = pool.submit(spec("a")).await.unwrap();

        let first = pool.collect(&job).await.unwrap();
        let second = pool.collect(&job).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_job_and_model() {
        let pool = pool(8).await;
        assert!(pool.collect(&JobId::from("missing")).await.is_err());
        assert!(pool.status(&JobId::from("missing")).await.is_err());

        let mut other = spec("a");
        other.model = "ghost".into();
        assert!(pool.submit(other).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_job_reports_message() {
        let pool = pool(8).await;
        let job = pool.submit(spec("zebra")).await.unwrap();

        let err = pool.collect(&job).await.unwrap_err();
        assert!(err.to_string().contains("zebra"));
        assert_eq!(pool.status(&job).await.unwrap(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_oldest_finished_jobs_are_evicted() {
        let pool = pool(2).await;
        let mut jobs = Vec::new();
        for _ in 0..3 {
            let job = pool.submit(spec("a")).await.unwrap();
            pool.collect(&job).await.unwrap();
            jobs.push(job);
        }
        // Retirement runs right after the state change; give it a moment
        for _ in 0..50 {
            if pool.tracked_jobs().await <= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(pool.tracked_jobs().await, 2);
        assert!(pool.collect(&jobs[0]).await.is_err());
        assert!(pool.collect(&jobs[2]).await.is_ok());
    }

    #[tokio::test]
    async fn test_served_models_are_hot() {
        let pool = pool(8).await;
        let status = pool.fleet_status().await.unwrap();
        assert!(status["tiny"].hot);
        assert_eq!(status["tiny"].n_layers, 2);

        assert!(pool.unserve("tiny").await);
        assert!(pool.fleet_status().await.unwrap().is_empty());
    }
}
