//! Workbench configuration
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! ```toml
//! guest_identity = "guest@localhost"
//! tool_data_dir = "data"
//!
//! [backend]
//! mode = "remote"
//! host = "http://localhost:5001"
//!
//! [[models]]
//! name = "meta-llama/Llama-3.2-1B"
//! chat = false
//! gated = true
//! n_layers = 16
//! params = "1B"
//!
//! [[tools]]
//! name = "concept-lens"
//! [[tools.models]]
//! model_name = "meta-llama/Llama-3.2-1B"
//! n_concept_heads = 8
//! data_paths = { concept_heads = "llama-1b/concept_heads.json" }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::ExecutionMode;
use crate::error::{Result, WorkbenchError};

pub const ENV_MODE: &str = "LENSBENCH_MODE";
pub const ENV_API_HOST: &str = "LENSBENCH_API_HOST";
pub const ENV_API_KEY: &str = "LENSBENCH_API_KEY";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchConfig {
    pub backend: BackendConfig,
    /// Identity treated as anonymous
    pub guest_identity: String,
    /// Base directory for relative tool data paths
    pub tool_data_dir: Option<PathBuf>,
    pub models: Vec<ModelConfig>,
    pub tools: Vec<ToolConfig>,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            guest_identity: "guest@localhost".to_string(),
            tool_data_dir: None,
            models: Vec::new(),
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: ExecutionMode,
    /// Remote job API base URL; without it remote jobs run on an in-process worker
    pub host: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub collect_timeout_secs: u64,
    pub fleet_refresh_secs: u64,
    pub max_retained_jobs: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            host: None,
            api_key: None,
            poll_interval_ms: 500,
            collect_timeout_secs: 300,
            fleet_refresh_secs: 60,
            max_retained_jobs: 256,
        }
    }
}

impl BackendConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }

    pub fn fleet_refresh(&self) -> Duration {
        Duration::from_secs(self.fleet_refresh_secs)
    }
}

/// A servable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// HuggingFace repo to load from, when it differs from `name`
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub chat: bool,
    #[serde(default)]
    pub gated: bool,
    pub n_layers: usize,
    #[serde(default)]
    pub params: String,
}

impl ModelConfig {
    pub fn repo_id(&self) -> &str {
        self.repo.as_deref().unwrap_or(&self.name)
    }
}

/// A tool and its per-model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub models: Vec<ToolModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolModelConfig {
    pub model_name: String,
    #[serde(default)]
    pub n_concept_heads: Option<usize>,
    /// Auxiliary data files by key, relative to `tool_data_dir`
    #[serde(default)]
    pub data_paths: HashMap<String, PathBuf>,
}

impl WorkbenchConfig {
    /// Load from a TOML file, apply environment overrides and validate
    /// Load `path` with overrides from the process environment
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Load `path` with `LENSBENCH_*` overrides read through `lookup`
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkbenchError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        info!(
            "Loaded config from {} ({} models, {} tools, {:?} mode)",
            path.display(),
            config.models.len(),
            config.tools.len(),
            config.backend.mode
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WorkbenchError::config(e.to_string()))
    }

    /// Apply `LENSBENCH_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup(ENV_MODE) {
            self.backend.mode = mode
                .parse()
                .map_err(|e: anyhow::Error| WorkbenchError::config(format!("{ENV_MODE}: {e}")))?;
            debug!("{} overrides mode to {:?}", ENV_MODE, self.backend.mode);
        }
        if let Some(host) = lookup(ENV_API_HOST) {
            self.backend.host = Some(host);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.backend.api_key = Some(key);
        }
        Ok(())
    }

    /// Reject duplicate models and tool entries for unknown models
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(WorkbenchError::config(format!(
                    "model '{}' is listed twice",
                    model.name
                )));
            }
        }
        for tool in &self.tools {
            for entry in &tool.models {
                if !names.contains(entry.model_name.as_str()) {
                    return Err(WorkbenchError::config(format!(
                        "tool '{}' names unknown model '{}'",
                        tool.name, entry.model_name
                    )));
                }
            }
        }
        if self.backend.poll_interval_ms == 0 {
            return Err(WorkbenchError::config("backend.poll_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Tool settings for one model
    pub fn tool_model(&self, tool: &str, model: &str) -> Option<&ToolModelConfig> {
        self.tools
            .iter()
            .filter(|t| t.name == tool)
            .flat_map(|t| t.models.iter())
            .find(|m| m.model_name == model)
    }

    /// Every tool configured for `model`, with its settings
    pub fn tools_for(&self, model: &str) -> Vec<(&str, &ToolModelConfig)> {
        self.tools
            .iter()
            .flat_map(|t| {
                t.models
                    .iter()
                    .filter(move |m| m.model_name == model)
                    .map(move |m| (t.name.as_str(), m))
            })
            .collect()
    }

    /// Resolve a tool data path against `tool_data_dir`
    pub fn data_path(&self, path: &Path) -> PathBuf {
        match &self.tool_data_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}
