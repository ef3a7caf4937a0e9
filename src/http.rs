//! HTTP remote executor
//!
//! Talks to a remote job API:
//!
//! - `POST {host}/jobs` with a [`JobSpec`] body returns `{"job_id": ...}`
//! - `GET {host}/jobs/{id}` returns `{"status": ..., "description": ...}`
//! - `GET {host}/jobs/{id}/result` returns the [`RawPayload`]
//! - `GET {host}/stats` returns fleet status by model name
//!
//! The API key, when configured, is sent as `x-api-key`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{JobId, JobStatus, RemoteExecutor};
use crate::config::BackendConfig;
use crate::lens::{JobSpec, RawPayload};
use crate::registry::{FleetSource, FleetStatus};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Serialize, Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    description: Option<String>,
}

impl StatusResponse {
    fn job_status(&self) -> Result<JobStatus> {
        Ok(match self.status.to_uppercase().as_str() {
            "RECEIVED" | "QUEUED" | "SUBMITTED" => JobStatus::Submitted,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" | "COMPLETE" => JobStatus::Complete,
            "ERROR" | "FAILED" => JobStatus::Failed,
            other => anyhow::bail!("Unknown job status '{other}'"),
        })
    }
}

/// Remote executor over HTTP
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    host: String,
    api_key: Option<String>,
    poll_interval: Duration,
    collect_timeout: Duration,
}

impl HttpExecutor {
    pub fn new(
        host: &str,
        api_key: Option<String>,
        poll_interval: Duration,
        collect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            api_key,
            poll_interval,
            collect_timeout,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Remote backend host is not configured"))?;
        Self::new(
            host,
            config.api_key.clone(),
            config.poll_interval(),
            config.collect_timeout(),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{what} failed: {status} {body}");
        }
        Ok(response)
    }

    async fn job_state(&self, job_id: &JobId) -> Result<StatusResponse> {
        let response = self
            .send(self.client.get(self.url(&format!("/jobs/{job_id}"))), "Job status")
            .await?;
        response.json().await.context("Invalid job status response")
    }

    async fn wait_until_finished(&self, job_id: &JobId) -> Result<()> {
        loop {
            let state = self.job_state(job_id).await?;
            match state.job_status()? {
                JobStatus::Complete => return Ok(()),
                JobStatus::Failed => anyhow::bail!(
                    "{}",
                    state
                        .description
                        .unwrap_or_else(|| "job failed without a description".to_string())
                ),
                JobStatus::Submitted | JobStatus::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let response = self
            .send(self.client.post(self.url("/jobs")).json(&spec), "Job submission")
            .await?;
        let submitted: SubmitResponse = response
            .json()
            .await
            .context("Invalid job submission response")?;
        debug!("Submitted job {} to {}", submitted.job_id, self.host);
        Ok(submitted.job_id)
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.job_state(job_id).await?.job_status()
    }

    async fn collect(&self, job_id: &JobId) -> Result<RawPayload> {
        tokio::time::timeout(self.collect_timeout, self.wait_until_finished(job_id))
            .await
            .map_err(|_| {
                anyhow::anyhow!("Job did not finish within {:?}", self.collect_timeout)
            })??;

        let response = self
            .send(
                self.client.get(self.url(&format!("/jobs/{job_id}/result"))),
                "Job result",
            )
            .await?;
        response.json().await.context("Invalid job result payload")
    }
}

#[async_trait]
impl FleetSource for HttpExecutor {
    async fn fleet_status(&self) -> Result<FleetStatus> {
        let response = self
            .send(self.client.get(self.url("/stats")), "Fleet status")
            .await?;
        response.json().await.context("Invalid fleet status response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::Task;
    use crate::metrics::Metric;
    use crate::selection::{LayerSelection, Selection};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn json(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/json")
    }

    /// Mock answering `GET route` only when the API key is present
    fn get(route: &str) -> wiremock::MockBuilder {
        Mock::given(method("GET"))
            .and(path(route.to_string()))
            .and(header(API_KEY_HEADER, "secret"))
    }

    fn executor(host: &str) -> HttpExecutor {
        HttpExecutor::new(
            host,
            Some("secret".into()),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn spec() -> JobSpec {
        JobSpec {
            model: "tiny".into(),
            task: Task::LogitLens {
                prompt: "a".into(),
                metric: Metric::Entropy,
                position: None,
                selection: Selection::Scalar,
            },
        }
    }

    fn payload() -> RawPayload {
        RawPayload {
            input_ids: vec![0, 1],
            positions: vec![0, 1],
            targets: vec![],
            top_predictions: vec![1, 2],
            layers: vec![LayerSelection {
                values: vec![vec![0.5], vec![1.5]],
                indices: vec![vec![], vec![]],
            }],
        }
    }

    #[tokio::test]
    async fn test_submit_poll_collect() {
        let server = MockServer::start().await;
        let result = serde_json::to_string(&payload()).unwrap();

        Mock::given(method("POST"))
            .and(path("/jobs"))
            .and(header(API_KEY_HEADER, "secret"))
            .respond_with(json(r#"{"job_id":"job-7"}"#))
            .expect(1)
            .mount(&server)
            .await;
        get("/jobs/job-7")
            .respond_with(json(r#"{"status":"RUNNING"}"#))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        get("/jobs/job-7")
            .respond_with(json(r#"{"status":"COMPLETED"}"#))
            .mount(&server)
            .await;
        get("/jobs/job-7/result")
            .respond_with(json(&result))
            .mount(&server)
            .await;

        let http = executor(&server.uri());
        let job = http.submit(spec()).await.unwrap();
        assert_eq!(job.as_str(), "job-7");
        assert_eq!(http.collect(&job).await.unwrap(), payload());
        assert_eq!(http.status(&job).await.unwrap(), JobStatus::Complete);

        let polls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/jobs/job-7")
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_failed_job_carries_description() {
        let server = MockServer::start().await;
        get("/jobs/bad")
            .respond_with(json(r#"{"status":"ERROR","description":"CUDA OOM"}"#))
            .mount(&server)
            .await;

        let err = executor(&server.uri())
            .collect(&JobId::from("bad"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CUDA OOM"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_error() {
        let server = MockServer::start().await;
        get("/jobs/nope")
            .respond_with(ResponseTemplate::new(404).set_body_string("no such job"))
            .mount(&server)
            .await;

        let err = executor(&server.uri())
            .collect(&JobId::from("nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("no such job"));
    }

    #[tokio::test]
    async fn test_collect_times_out() {
        let server = MockServer::start().await;
        get("/jobs/slow")
            .respond_with(json(r#"{"status":"RUNNING"}"#))
            .mount(&server)
            .await;
        let http = HttpExecutor::new(
            &server.uri(),
            Some("secret".into()),
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
        .unwrap();
        let err = http.collect(&JobId::from("slow")).await.unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[tokio::test]
    async fn test_fleet_status_and_api_key() {
        let server = MockServer::start().await;
        get("/stats")
            .respond_with(json(r#"{"tiny":{"hot":true,"n_layers":2}}"#))
            .mount(&server)
            .await;

        let status = executor(&server.uri()).fleet_status().await.unwrap();
        assert!(status["tiny"].hot);
        assert!(!status["tiny"].gated);

        // Without the key no mock matches and the server answers 404
        let anonymous = HttpExecutor::new(
            &server.uri(),
            None,
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(anonymous.fleet_status().await.is_err());
    }

    #[test]
    fn test_status_mapping() {
        let parse = |s: &str| {
            StatusResponse {
                status: s.into(),
                description: None,
            }
            .job_status()
        };
        assert_eq!(parse("COMPLETED").unwrap(), JobStatus::Complete);
        assert_eq!(parse("queued").unwrap(), JobStatus::Submitted);
        assert_eq!(parse("ERROR").unwrap(), JobStatus::Failed);
        assert!(parse("LOST").is_err());
    }

    #[test]
    fn test_from_config_requires_host() {
        assert!(HttpExecutor::from_config(&BackendConfig::default()).is_err());
        let config = BackendConfig {
            host: Some("http://localhost:5001/".into()),
            ..BackendConfig::default()
        };
        assert_eq!(HttpExecutor::from_config(&config).unwrap().host(), "http://localhost:5001");
    }
}
