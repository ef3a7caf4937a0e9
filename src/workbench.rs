//! Query entry points
//!
//! [`Workbench`] ties the registry, the execution mode and telemetry
//! together. Both modes share the same two-phase contract:
//! [`Workbench::start_query`] then, in remote mode,
//! [`Workbench::collect_query`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{Execution, JobId, QueryStart};
use crate::error::{Result, Stage, StageContext, WorkbenchError};
use crate::lens::{execute, RawPayload};
use crate::registry::{ModelRegistry, ModelSummary, ResolvedModel};
use crate::render::render;
use crate::request::{QueryRequest, Tool};
use crate::shaping::Visualization;
use crate::telemetry::{LatencyTimer, Method, RequestStatus, TelemetryEvent, TelemetrySink};

pub struct Workbench {
    registry: Arc<ModelRegistry>,
    execution: Execution,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Workbench {
    pub fn new(
        registry: Arc<ModelRegistry>,
        execution: Execution,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            registry,
            execution,
            telemetry,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Start a query
    ///
    /// Local mode computes and returns the shaped result. Remote mode submits
    /// the job and returns its id.
    pub async fn start_query(
        &self,
        caller: Option<&str>,
        request: &QueryRequest,
    ) -> Result<QueryStart> {
        self.emit(RequestStatus::Started, caller, Method::Start, request, None, None);
        let outcome = self.start(caller, request).await;
        match &outcome {
            Ok(QueryStart::Complete { .. }) => {
                self.emit(RequestStatus::Complete, caller, Method::Start, request, None, None)
            }
            Ok(QueryStart::Pending { job_id }) => {
                self.emit(RequestStatus::Ready, caller, Method::Start, request, Some(job_id), None)
            }
            Err(e) => self.emit(
                RequestStatus::Error,
                caller,
                Method::Start,
                request,
                e.job_id(),
                Some(e.to_string()),
            ),
        }
        outcome
    }

    async fn start(&self, caller: Option<&str>, request: &QueryRequest) -> Result<QueryStart> {
        request.validate()?;
        let model = self.authorize(caller, request).await?;
        let concept_heads = match request.tool() {
            Tool::ConceptLens => self.concept_heads(request.model()).await?,
            Tool::LogitLens | Tool::ActivationPatching => None,
        };
        let spec = request.plan(concept_heads)?;

        match &self.execution {
            Execution::Local => {
                let tracer = model
                    .tracer
                    .clone()
                    .ok_or_else(|| WorkbenchError::ModelUnavailable(model.name.clone()))?;
                let codec = model.codec.clone();
                let payload = tokio::task::spawn_blocking(move || {
                    execute(tracer.as_ref(), codec.as_ref(), &spec.task)
                })
                .await
                .map_err(|e| WorkbenchError::compute(Stage::Trace, e))??;
                let data = self.shape(request, &payload, &model)?;
                Ok(QueryStart::Complete { data })
            }
            Execution::Remote(executor) => {
                let job_id = executor
                    .submit(spec)
                    .await
                    .map_err(|e| WorkbenchError::backend(None, format!("submission failed: {e:#}")))?;
                debug!("Started {} job {}", request.tool(), job_id);
                Ok(QueryStart::Pending { job_id })
            }
        }
    }

    /// Collect a remote job started by [`Workbench::start_query`] and shape it
    ///
    /// `request` must be the request the job was started with.
    pub async fn collect_query(
        &self,
        caller: Option<&str>,
        job_id: &JobId,
        request: &QueryRequest,
    ) -> Result<Visualization> {
        let timer = LatencyTimer::start(
            self.telemetry.clone(),
            caller,
            Method::Collect,
            request.tool(),
            Some(job_id),
        );
        let outcome = self.collect(caller, job_id, request).await;
        timer.finish(&outcome);
        if outcome.is_ok() {
            self.emit(
                RequestStatus::Complete,
                caller,
                Method::Collect,
                request,
                Some(job_id),
                None,
            );
        }
        outcome
    }

    async fn collect(
        &self,
        caller: Option<&str>,
        job_id: &JobId,
        request: &QueryRequest,
    ) -> Result<Visualization> {
        let Execution::Remote(executor) = &self.execution else {
            return Err(WorkbenchError::backend(
                Some(job_id),
                "local execution has no jobs to collect",
            ));
        };
        request.validate()?;
        let model = self.authorize(caller, request).await?;

        let payload = executor
            .collect(job_id)
            .await
            .map_err(|e| WorkbenchError::backend(Some(job_id), format!("{e:#}")))?;
        self.shape(request, &payload, &model)
    }

    /// Models currently loaded, with the caller's access to each
    pub async fn list_models(&self, caller: Option<&str>) -> Vec<ModelSummary> {
        self.refresh().await;
        self.registry.list_models(caller).await
    }

    async fn refresh(&self) {
        if let Err(e) = self.registry.refresh().await {
            warn!("Fleet refresh failed, using loaded models: {}", e);
        }
    }

    /// Access check first, then resolve; no model work happens for denied callers
    async fn authorize(&self, caller: Option<&str>, request: &QueryRequest) -> Result<ResolvedModel> {
        let name = request.model();
        if !self.registry.is_accessible(caller, name) {
            return Err(WorkbenchError::AccessDenied {
                model: name.to_string(),
            });
        }
        if !self.registry.is_loaded(name).await {
            self.refresh().await;
        }
        self.registry.resolve(name).await
    }

    async fn concept_heads(&self, model: &str) -> Result<Option<Vec<crate::tracer::ConceptHead>>> {
        match self.registry.tool_data(model, Tool::ConceptLens.name()).await {
            Some(data) => data
                .concept_heads()
                .map_err(|e| WorkbenchError::validation(format!("{e:#}"))),
            None => Ok(None),
        }
    }

    fn shape(
        &self,
        request: &QueryRequest,
        payload: &RawPayload,
        model: &ResolvedModel,
    ) -> Result<Visualization> {
        render(request.layout(), payload, model.codec.as_ref()).stage(Stage::Shaping)
    }

    fn emit(
        &self,
        status: RequestStatus,
        caller: Option<&str>,
        method: Method,
        request: &QueryRequest,
        job_id: Option<&JobId>,
        message: Option<String>,
    ) {
        self.telemetry.emit(TelemetryEvent::Request {
            status,
            caller: caller.map(str::to_string),
            method,
            tool: request.tool(),
            metric: Some(request.metric()),
            job_id: job_id.cloned(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkbenchConfig;
    use crate::metrics::Metric;
    use crate::mock::{RecordingSink, ScriptedFleet, StaticLoader, WordCodec};
    use crate::registry::StaticFleet;
    use crate::mock::ScriptedTracer;
    use crate::request::{LensRequest, View};
    use crate::tracer::{LayerSeries, Tracer};
    use crate::worker::WorkerPool;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    const CONFIG: &str = r#"
[[models]]
name = "tiny"
n_layers = 2

[[models]]
name = "locked"
gated = true
n_layers = 2
"#;

    fn codec() -> WordCodec {
        WordCodec::new(["<s>", "The", "cat", "sat", "on", "mat"])
    }

    fn request(model: &str) -> QueryRequest {
        QueryRequest::LogitLens(LensRequest {
            model: model.into(),
            prompt: "The cat".into(),
            metric: Metric::Probability,
            token_position: None,
            target_ids: Some(vec![2, 3]),
            top_k: None,
            view: View::Line,
        })
    }

    fn local() -> (Workbench, Arc<StaticLoader>, Arc<RecordingSink>) {
        let config = Arc::new(WorkbenchConfig::from_toml_str(CONFIG).unwrap());
        let loader = Arc::new(StaticLoader::new(codec()));
        let fleet = Arc::new(StaticFleet::from_config(&config));
        let registry = Arc::new(ModelRegistry::new(config, loader.clone(), fleet, true));
        let sink = Arc::new(RecordingSink::default());
        (
            Workbench::new(registry, Execution::Local, sink.clone()),
            loader,
            sink,
        )
    }

    #[tokio::test]
    async fn test_local_start_returns_data() {
        let (bench, _, sink) = local();
        let start = bench.start_query(None, &request("tiny")).await.unwrap();

        let data = start.into_data().unwrap();
        let lines = data.lines().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "cat");
        assert_eq!(lines[0].data.len(), 3);

        let statuses: Vec<_> = sink.events().iter().filter_map(|e| e.status()).collect();
        assert_eq!(statuses, vec![RequestStatus::Started, RequestStatus::Complete]);
    }

    #[tokio::test]
    async fn test_gated_model_denied_before_loading() {
        let (bench, loader, sink) = local();
        let err = bench.start_query(Some("guest@localhost"), &request("locked")).await.unwrap_err();

        assert!(matches!(err, WorkbenchError::AccessDenied { .. }));
        assert_eq!(loader.loads(), 0);
        assert_eq!(sink.events().last().and_then(|e| e.status()), Some(RequestStatus::Error));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let (bench, loader, _) = local();
        let mut req = request("tiny");
        if let QueryRequest::LogitLens(r) = &mut req {
            r.target_ids = None;
        }
        let err = bench.start_query(None, &req).await.unwrap_err();
        assert_eq!(err.to_http_status(), 400);
        assert_eq!(loader.loads(), 0);
    }

    #[tokio::test]
    async fn test_local_collect_is_backend_error() {
        let (bench, _, _) = local();
        let err = bench
            .collect_query(None, &JobId::from("x"), &request("tiny"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "backend");
    }

    #[tokio::test]
    async fn test_remote_round_trip_through_worker() {
        let config = Arc::new(WorkbenchConfig::from_toml_str(CONFIG).unwrap());
        let worker = Arc::new(WorkerPool::new(16));
        let tracer = Arc::new(crate::mock::ScriptedTracer::new(2, 6));
        worker
            .serve("tiny", tracer.clone(), Arc::new(codec()), Default::default())
            .await;

        let loader = Arc::new(StaticLoader::new(codec()));
        let registry = Arc::new(ModelRegistry::new(config, loader, worker.clone(), false));
        let sink = Arc::new(RecordingSink::default());
        let bench = Workbench::new(registry, Execution::Remote(worker), sink.clone());

        let start = bench.start_query(Some("ada"), &request("tiny")).await.unwrap();
        let job_id = start.job_id().cloned().unwrap();
        let data = bench.collect_query(Some("ada"), &job_id, &request("tiny")).await.unwrap();
        assert_eq!(data.lines().unwrap().len(), 2);
        assert_eq!(tracer.trace_calls(), 1);

        // Unknown job ids fail cleanly
        let err = bench
            .collect_query(Some("ada"), &JobId::from("nope"), &request("tiny"))
            .await
            .unwrap_err();
        assert_eq!(err.job_id().map(JobId::as_str), Some("nope"));
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TelemetryEvent::Latency { .. })));
    }

    #[tokio::test]
    async fn test_unloaded_model_is_unavailable() {
        let config = Arc::new(WorkbenchConfig::from_toml_str(CONFIG).unwrap());
        let loader = Arc::new(StaticLoader::new(codec()));
        let fleet = Arc::new(ScriptedFleet::new());
        let registry = Arc::new(ModelRegistry::new(config, loader, fleet, true));
        let bench = Workbench::new(registry, Execution::Local, Arc::new(RecordingSink::default()));

        let err = bench.start_query(None, &request("tiny")).await.unwrap_err();
        assert!(matches!(err, WorkbenchError::ModelUnavailable(_)));
        assert!(err.is_retryable());
    }

    fn remote(worker: Arc<WorkerPool>) -> (Workbench, Arc<RecordingSink>) {
        let config = Arc::new(WorkbenchConfig::from_toml_str(CONFIG).unwrap());
        let loader = Arc::new(StaticLoader::new(codec()));
        let fleet = Arc::new(StaticFleet::from_config(&config));
        let registry = Arc::new(ModelRegistry::new(config, loader, fleet, false));
        let sink = Arc::new(RecordingSink::default());
        (
            Workbench::new(registry, Execution::Remote(worker), sink.clone()),
            sink,
        )
    }

    #[tokio::test]
    async fn test_failed_submission_has_no_job() {
        // Hot in the fleet, but the worker does not serve it
        let (bench, sink) = remote(Arc::new(WorkerPool::new(4)));

        let err = bench.start_query(Some("ada"), &request("tiny")).await.unwrap_err();
        assert!(matches!(err, WorkbenchError::Backend { .. }));
        assert!(err.job_id().is_none());
        assert!(err.to_string().contains("submission failed"));

        let events = sink.events();
        let statuses: Vec<_> = events.iter().filter_map(|e| e.status()).collect();
        assert_eq!(statuses, vec![RequestStatus::Started, RequestStatus::Error]);
        assert!(matches!(
            events.last(),
            Some(TelemetryEvent::Request {
                method: Method::Start,
                job_id: None,
                ..
            })
        ));
    }

    /// Tracer that holds every trace until the gate opens
    struct GatedTracer {
        inner: ScriptedTracer,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GatedTracer {
        fn new() -> Self {
            Self {
                inner: ScriptedTracer::new(2, 6),
                open: Mutex::new(false),
                opened: Condvar::new(),
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl Tracer for GatedTracer {
        fn n_layers(&self) -> usize {
            self.inner.n_layers()
        }

        fn vocab_size(&self) -> usize {
            self.inner.vocab_size()
        }

        fn trace(&self, input_ids: &[u32]) -> anyhow::Result<LayerSeries> {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            drop(open);
            self.inner.trace(input_ids)
        }
    }

    #[tokio::test]
    async fn test_pending_collect_does_not_block_submission() {
        let worker = Arc::new(WorkerPool::new(16));
        let tracer = Arc::new(GatedTracer::new());
        worker
            .serve("tiny", tracer.clone(), Arc::new(codec()), Default::default())
            .await;
        let (bench, _) = remote(worker);

        let first = bench.start_query(Some("ada"), &request("tiny")).await.unwrap();
        let first_id = first.job_id().cloned().unwrap();

        let collect_request = request("tiny");
        let second_request = request("tiny");
        let collect = bench.collect_query(Some("ada"), &first_id, &collect_request);
        tokio::pin!(collect);
        let second = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::select! {
                biased;
                _ = &mut collect => panic!("collect finished while the trace was held"),
                started = bench.start_query(Some("bob"), &second_request) => started,
            }
        })
        .await
        .expect("submission blocked behind a pending collect")
        .unwrap();
        let second_id = second.job_id().cloned().unwrap();
        assert_ne!(first_id, second_id);

        tracer.release();
        let data = collect.await.unwrap();
        assert_eq!(data.lines().unwrap().len(), 2);
        let data = bench
            .collect_query(Some("bob"), &second_id, &request("tiny"))
            .await
            .unwrap();
        assert_eq!(data.lines().unwrap().len(), 2);
    }
}
