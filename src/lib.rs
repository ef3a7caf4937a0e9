// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 for signed token positions
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ModelRegistry in registry.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // i64→usize after range checks

//! lensbench: per-layer interpretability queries
//!
//! Answers "what does the model predict at each layer?" for a prompt. The
//! logit lens decodes every residual stream through the unembedding,
//! activation patching swaps residuals between two prompts, and the concept
//! lens projects residuals through attention-head OV circuits. Queries run
//! in-process or as jobs on a remote executor and come back shaped as line
//! series or heatmap grids.
//!
//! ## Architecture
//!
//! - `request`: Query requests, validation and planning into jobs
//! - `lens`: Job payloads and the compute pipeline (trace → metric → selection)
//! - `metrics`: Probability, rank and entropy over vocabulary logits
//! - `selection`: Target-id, top-k and scalar selection per layer
//! - `shaping` / `render`: Line and grid visualizations
//! - `tracer`: Model tracing capability; `forward_llama` implements it with candle
//! - `masks`: Cached causal attention masks
//! - `tokenizer`: Token encode/decode capability
//! - `registry`: Loaded models, fleet status and caller access
//! - `backend`: Execution modes and the remote job protocol
//! - `worker`: In-process remote executor
//! - `http`: HTTP remote executor
//! - `workbench`: Query entry points tying everything together
//! - `telemetry`: Request and latency events
//! - `config`: TOML configuration with environment overrides
//! - `mock`: Scripted capabilities for tests (`test-support` feature)

pub mod backend;
pub mod config;
pub mod error;
pub mod forward_llama;
pub mod http;
pub mod lens;
pub mod masks;
pub mod metrics;
#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod mock;
pub mod registry;
pub mod render;
pub mod request;
pub mod selection;
pub mod shaping;
pub mod telemetry;
pub mod tokenizer;
pub mod tracer;
pub mod worker;
pub mod workbench;

pub use backend::{Execution, ExecutionMode, JobId, JobStatus, QueryStart, RemoteExecutor};
pub use config::{BackendConfig, ModelConfig, ToolConfig, ToolModelConfig, WorkbenchConfig};
pub use error::{Result, Stage, WorkbenchError};
pub use forward_llama::{HubLoader, LlamaConfig, LlamaTracer};
pub use http::HttpExecutor;
pub use lens::{execute, JobSpec, RawPayload, Task};
pub use metrics::Metric;
pub use registry::{
    FleetModel, FleetSource, LoadedModel, ModelLoader, ModelRegistry, ModelSummary, StaticFleet,
};
pub use request::{
    ConceptRequest, LensRequest, PatchRequest, QueryRequest, Tool, View, DEFAULT_CONCEPT_TOP_K,
};
pub use selection::{LayerSelection, Selection, TokenPosition};
pub use shaping::{Cell, Line, Point, Row, Visualization};
pub use telemetry::{NullSink, TelemetryEvent, TelemetrySink, TracingSink};
pub use tokenizer::TokenCodec;
pub use tracer::{ConceptHead, LayerSeries, PatchTrace, Tracer};
pub use worker::WorkerPool;
pub use workbench::Workbench;
