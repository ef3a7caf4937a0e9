//! Request telemetry
//!
//! Events are fire-and-forget: a [`TelemetrySink`] cannot fail a request.
//! [`LatencyTimer`] measures result collection and reports on every exit
//! path, including being dropped before it was finished.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::JobId;
use crate::error::WorkbenchError;
use crate::metrics::Metric;
use crate::request::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Started,
    Ready,
    Complete,
    Error,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Started => "STARTED",
            RequestStatus::Ready => "READY",
            RequestStatus::Complete => "COMPLETE",
            RequestStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Workbench entry point an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Start,
    Collect,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Start => "start",
            Method::Collect => "collect",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Request {
        status: RequestStatus,
        caller: Option<String>,
        method: Method,
        tool: Tool,
        metric: Option<Metric>,
        job_id: Option<JobId>,
        message: Option<String>,
    },
    Latency {
        caller: Option<String>,
        method: Method,
        tool: Tool,
        job_id: Option<JobId>,
        latency: Duration,
    },
}

impl TelemetryEvent {
    pub fn status(&self) -> Option<RequestStatus> {
        match self {
            TelemetryEvent::Request { status, .. } => Some(*status),
            TelemetryEvent::Latency { .. } => None,
        }
    }
}

/// Destination for telemetry events
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Request {
                status: RequestStatus::Error,
                caller,
                method,
                tool,
                job_id,
                message,
                ..
            } => warn!(
                "{} {} failed for {} (job {}): {}",
                tool,
                method,
                caller.as_deref().unwrap_or("anonymous"),
                job_id.as_ref().map(JobId::as_str).unwrap_or("-"),
                message.as_deref().unwrap_or("")
            ),
            TelemetryEvent::Request {
                status,
                caller,
                method,
                tool,
                metric,
                job_id,
                ..
            } => info!(
                "{} {} {} for {} (metric {}, job {})",
                tool,
                method,
                status,
                caller.as_deref().unwrap_or("anonymous"),
                metric.map(Metric::as_str).unwrap_or("-"),
                job_id.as_ref().map(JobId::as_str).unwrap_or("-")
            ),
            TelemetryEvent::Latency {
                method,
                tool,
                job_id,
                latency,
                ..
            } => info!(
                "{} {} latency {:.3}s (job {})",
                tool,
                method,
                latency.as_secs_f64(),
                job_id.as_ref().map(JobId::as_str).unwrap_or("-")
            ),
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Scoped timer around result collection
///
/// [`LatencyTimer::finish`] records the latency on success or an ERROR
/// event on failure. Dropping an unfinished timer records an ERROR with the
/// message `"abandoned"`.
pub struct LatencyTimer {
    sink: Arc<dyn TelemetrySink>,
    caller: Option<String>,
    method: Method,
    tool: Tool,
    job_id: Option<JobId>,
    started: Instant,
    finished: bool,
}

impl LatencyTimer {
    pub fn start(
        sink: Arc<dyn TelemetrySink>,
        caller: Option<&str>,
        method: Method,
        tool: Tool,
        job_id: Option<&JobId>,
    ) -> Self {
        Self {
            sink,
            caller: caller.map(str::to_string),
            method,
            tool,
            job_id: job_id.cloned(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the outcome of the timed section
    pub fn finish<T>(mut self, outcome: &Result<T, WorkbenchError>) {
        self.finished = true;
        match outcome {
            Ok(_) => self.sink.emit(TelemetryEvent::Latency {
                caller: self.caller.clone(),
                method: self.method,
                tool: self.tool,
                job_id: self.job_id.clone(),
                latency: self.elapsed(),
            }),
            Err(e) => self.emit_error(e.to_string()),
        }
    }

    fn emit_error(&self, message: String) {
        self.sink.emit(TelemetryEvent::Request {
            status: RequestStatus::Error,
            caller: self.caller.clone(),
            method: self.method,
            tool: self.tool,
            metric: None,
            job_id: self.job_id.clone(),
            message: Some(message),
        });
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.emit_error("abandoned".to_string());
        }
    }
}
