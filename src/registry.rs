//! Model and access registry
//!
//! The registry is the only shared mutable state. Mutations (`report_hot`,
//! `report_cold`) are serialized by a writer lock; readers see either a fully
//! loaded model or none at all, since entries are inserted and removed whole.
//! Fleet status is polled through a [`FleetSource`] and cached for a fixed
//! interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ModelConfig, ToolModelConfig, WorkbenchConfig};
use crate::error::{Result, WorkbenchError};
use crate::tokenizer::TokenCodec;
use crate::tracer::{ConceptHead, Tracer};

/// Tool aux data key holding concept-lens heads
pub const CONCEPT_HEADS_KEY: &str = "concept_heads";

/// One model as reported by the fleet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FleetModel {
    pub hot: bool,
    #[serde(default)]
    pub gated: bool,
    #[serde(default)]
    pub n_layers: usize,
    #[serde(default)]
    pub params: String,
}

/// Fleet status by model name
pub type FleetStatus = HashMap<String, FleetModel>;

/// Source of fleet status
#[async_trait]
pub trait FleetSource: Send + Sync {
    async fn fleet_status(&self) -> anyhow::Result<FleetStatus>;
}

/// Fleet where every configured model is always hot (local serving)
#[derive(Debug, Clone, Default)]
pub struct StaticFleet {
    status: FleetStatus,
}

impl StaticFleet {
    pub fn new(status: FleetStatus) -> Self {
        Self { status }
    }

    pub fn from_config(config: &WorkbenchConfig) -> Self {
        let status = config
            .models
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    FleetModel {
                        hot: true,
                        gated: m.gated,
                        n_layers: m.n_layers,
                        params: m.params.clone(),
                    },
                )
            })
            .collect();
        Self { status }
    }

    /// Keep only the models for which `keep` returns true
    pub fn retain(mut self, keep: impl Fn(&str) -> bool) -> Self {
        self.status.retain(|name, _| keep(name));
        self
    }
}

#[async_trait]
impl FleetSource for StaticFleet {
    async fn fleet_status(&self) -> anyhow::Result<FleetStatus> {
        Ok(self.status.clone())
    }
}

/// Fleet status cached for a fixed interval
///
/// Callers within the interval share one snapshot; only one caller at a
/// time refreshes an expired snapshot.
pub struct FleetCache {
    interval: Duration,
    snapshot: RwLock<Option<(Instant, Arc<FleetStatus>)>>,
    refresh: Mutex<()>,
}

impl FleetCache {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    async fn fresh(&self) -> Option<Arc<FleetStatus>> {
        match &*self.snapshot.read().await {
            Some((taken, status)) if taken.elapsed() < self.interval => Some(status.clone()),
            _ => None,
        }
    }

    /// Current snapshot, polling `source` if the cached one expired
    pub async fn get(&self, source: &dyn FleetSource) -> anyhow::Result<Arc<FleetStatus>> {
        if let Some(status) = self.fresh().await {
            return Ok(status);
        }

        let _refresh = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(status) = self.fresh().await {
            return Ok(status);
        }

        let status = Arc::new(source.fleet_status().await?);
        debug!("Fleet status refreshed ({} models)", status.len());
        *self.snapshot.write().await = Some((Instant::now(), status.clone()));
        Ok(status)
    }

    /// Drop the cached snapshot
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}

/// Capability handles produced by a [`ModelLoader`]
#[derive(Clone)]
pub struct LoadedModel {
    /// Present when the model is served in process
    pub tracer: Option<Arc<dyn Tracer>>,
    pub codec: Arc<dyn TokenCodec>,
}

/// Loads capability handles for a configured model
///
/// Called on a blocking thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model: &ModelConfig, with_tracer: bool) -> anyhow::Result<LoadedModel>;
}

/// Auxiliary data of one tool for one model
#[derive(Debug, Clone, Default)]
pub struct ToolData {
    pub settings: ToolModelConfig,
    pub entries: HashMap<String, serde_json::Value>,
}

impl ToolData {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Concept heads, truncated to the configured `n_concept_heads`
    pub fn concept_heads(&self) -> anyhow::Result<Option<Vec<ConceptHead>>> {
        let Some(value) = self.entries.get(CONCEPT_HEADS_KEY) else {
            return Ok(None);
        };
        let mut heads: Vec<ConceptHead> =
            serde_json::from_value(value.clone()).context("Malformed concept head data")?;
        if let Some(n) = self.settings.n_concept_heads {
            heads.truncate(n);
        }
        Ok(Some(heads))
    }
}

struct ModelEntry {
    config: ModelConfig,
    loaded: LoadedModel,
    tool_data: HashMap<String, Arc<ToolData>>,
}

/// Handles of a loaded model, cloned out of the registry
#[derive(Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub n_layers: usize,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub codec: Arc<dyn TokenCodec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Base,
}

/// Entry of [`ModelRegistry::list_models`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub gated: bool,
    pub accessible: bool,
    pub n_layers: usize,
    pub params: String,
}

pub struct ModelRegistry {
    config: Arc<WorkbenchConfig>,
    loader: Arc<dyn ModelLoader>,
    fleet: Arc<dyn FleetSource>,
    fleet_cache: FleetCache,
    load_tracers: bool,
    models: RwLock<HashMap<String, Arc<ModelEntry>>>,
    writer: Mutex<()>,
}

impl ModelRegistry {
    /// Create an empty registry
    ///
    /// With `load_tracers` the loader also builds the local tracing
    /// capability; remote serving only needs the token codec.
    pub fn new(
        config: Arc<WorkbenchConfig>,
        loader: Arc<dyn ModelLoader>,
        fleet: Arc<dyn FleetSource>,
        load_tracers: bool,
    ) -> Self {
        let fleet_cache = FleetCache::new(config.backend.fleet_refresh());
        Self {
            config,
            loader,
            fleet,
            fleet_cache,
            load_tracers,
            models: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &WorkbenchConfig {
        &self.config
    }

    /// Load a model that became hot; no-op if it is already loaded
    ///
    /// Returns whether the model was newly loaded.
    pub async fn report_hot(&self, name: &str) -> Result<bool> {
        let _writer = self.writer.lock().await;
        if self.models.read().await.contains_key(name) {
            return Ok(false);
        }

        let model_config = self
            .config
            .model(name)
            .cloned()
            .ok_or_else(|| WorkbenchError::ModelUnavailable(name.to_string()))?;
        let tool_settings: Vec<(String, ToolModelConfig)> = self
            .config
            .tools_for(name)
            .into_iter()
            .map(|(tool, settings)| {
                let mut settings = settings.clone();
                for path in settings.data_paths.values_mut() {
                    *path = self.config.data_path(path);
                }
                (tool.to_string(), settings)
            })
            .collect();

        info!("Loading model: {}", name);
        let loader = self.loader.clone();
        let with_tracer = self.load_tracers;
        let entry = tokio::task::spawn_blocking(move || -> anyhow::Result<ModelEntry> {
            let loaded = loader.load(&model_config, with_tracer)?;
            let tool_data = load_tool_data(tool_settings)?;
            Ok(ModelEntry {
                config: model_config,
                loaded,
                tool_data,
            })
        })
        .await
        .map_err(|e| WorkbenchError::backend(None, format!("model load for '{name}' aborted: {e}")))?
        .map_err(|e| WorkbenchError::backend(None, format!("failed to load '{name}': {e:#}")))?;

        debug!(
            "Model {} loaded with {} tool data sets",
            name,
            entry.tool_data.len()
        );
        self.models
            .write()
            .await
            .insert(name.to_string(), Arc::new(entry));
        Ok(true)
    }

    /// Unload a model that went cold, purging its tool data
    ///
    /// Returns whether the model was loaded.
    pub async fn report_cold(&self, name: &str) -> bool {
        let _writer = self.writer.lock().await;
        let removed = self.models.write().await.remove(name).is_some();
        if removed {
            info!("Unloaded model: {}", name);
        }
        removed
    }

    /// Handles of a loaded model
    pub async fn resolve(&self, name: &str) -> Result<ResolvedModel> {
        let models = self.models.read().await;
        let entry = models
            .get(name)
            .ok_or_else(|| WorkbenchError::ModelUnavailable(name.to_string()))?;
        Ok(ResolvedModel {
            name: entry.config.name.clone(),
            n_layers: entry.config.n_layers,
            tracer: entry.loaded.tracer.clone(),
            codec: entry.loaded.codec.clone(),
        })
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.models.read().await.contains_key(name)
    }

    /// Names of loaded models, sorted
    pub async fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Auxiliary data of `tool` for a loaded model
    pub async fn tool_data(&self, model: &str, tool: &str) -> Option<Arc<ToolData>> {
        self.models
            .read()
            .await
            .get(model)
            .and_then(|entry| entry.tool_data.get(tool).cloned())
    }

    /// Absent, empty and guest identities are anonymous
    pub fn is_anonymous(&self, caller: Option<&str>) -> bool {
        match caller.map(str::trim) {
            None | Some("") => true,
            Some(id) => id == self.config.guest_identity,
        }
    }

    /// Anonymous callers may only use models configured as not gated
    pub fn is_accessible(&self, caller: Option<&str>, model: &str) -> bool {
        if !self.is_anonymous(caller) {
            return true;
        }
        self.config.model(model).is_some_and(|m| !m.gated)
    }

    /// Bring loaded models in line with the (cached) fleet status
    pub async fn refresh(&self) -> Result<()> {
        let status = self
            .fleet_cache
            .get(self.fleet.as_ref())
            .await
            .map_err(|e| WorkbenchError::backend(None, format!("fleet status: {e:#}")))?;

        for model in &self.config.models {
            let hot = status.get(&model.name).is_some_and(|m| m.hot);
            if hot {
                if let Err(e) = self.report_hot(&model.name).await {
                    warn!("Model {} is hot but failed to load: {}", model.name, e);
                }
            } else if self.is_loaded(&model.name).await {
                self.report_cold(&model.name).await;
            }
        }
        Ok(())
    }

    /// Force the next refresh to poll the fleet
    pub async fn invalidate_fleet(&self) {
        self.fleet_cache.invalidate().await;
    }

    /// Loaded models with the caller's access to each
    pub async fn list_models(&self, caller: Option<&str>) -> Vec<ModelSummary> {
        let models = self.models.read().await;
        self.config
            .models
            .iter()
            .filter(|m| models.contains_key(&m.name))
            .map(|m| ModelSummary {
                name: m.name.clone(),
                kind: if m.chat { ModelKind::Chat } else { ModelKind::Base },
                gated: m.gated,
                accessible: self.is_accessible(caller, &m.name),
                n_layers: m.n_layers,
                params: m.params.clone(),
            })
            .collect()
    }
}

fn load_tool_data(
    tool_settings: Vec<(String, ToolModelConfig)>,
) -> anyhow::Result<HashMap<String, Arc<ToolData>>> {
    let mut out = HashMap::new();
    for (tool, settings) in tool_settings {
        let mut entries = HashMap::new();
        for (key, path) in &settings.data_paths {
            let content = std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read {tool} data '{key}' from {}", path.display())
            })?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?;
            entries.insert(key.clone(), value);
        }
        out.insert(tool, Arc::new(ToolData { settings, entries }));
    }
    Ok(out)
}
