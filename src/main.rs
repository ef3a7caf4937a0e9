//! lensbench CLI: per-layer logit lens, activation patching and concept lens

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lensbench::{
    ConceptRequest, Execution, ExecutionMode, FleetModel, HttpExecutor, HubLoader, LensRequest,
    Metric, ModelConfig, ModelLoader, ModelRegistry, PatchRequest, QueryRequest, QueryStart,
    StaticFleet, TokenPosition, TracingSink, View, WorkbenchConfig, WorkerPool, Workbench,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "lensbench")]
#[command(about = "Per-layer interpretability queries over language models")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Caller identity; omitted means anonymous
    #[arg(long)]
    caller: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Logit lens over every layer of a prompt
    Lens {
        /// Model name from the config, or a HuggingFace repo id
        #[arg(short, long)]
        model: String,
        prompt: String,
        #[arg(long, default_value = "probability")]
        metric: Metric,
        /// Token position: index, negative index from the end, or "last"
        #[arg(long, value_parser = parse_position)]
        position: Option<TokenPosition>,
        /// Target token ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        targets: Vec<u32>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Shape as a heatmap grid instead of lines
        #[arg(long)]
        grid: bool,
    },
    /// Patch the source residual into the target prompt, layer by layer
    Patch {
        #[arg(short, long)]
        model: String,
        #[arg(long)]
        src: String,
        #[arg(long, value_parser = parse_position, default_value = "last")]
        src_position: TokenPosition,
        #[arg(long)]
        tgt: String,
        #[arg(long, value_parser = parse_position, default_value = "last")]
        tgt_position: TokenPosition,
        #[arg(long, default_value = "probability")]
        metric: Metric,
        #[arg(long, value_delimiter = ',')]
        targets: Vec<u32>,
    },
    /// Project each layer through the model's concept heads
    Concept {
        #[arg(short, long)]
        model: String,
        prompt: String,
        #[arg(long, value_parser = parse_position, default_value = "last")]
        position: TokenPosition,
        #[arg(long, value_delimiter = ',')]
        targets: Vec<u32>,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// List loaded models and the caller's access
    Models,
}

impl Command {
    fn model(&self) -> Option<&str> {
        match self {
            Command::Lens { model, .. }
            | Command::Patch { model, .. }
            | Command::Concept { model, .. } => Some(model),
            Command::Models => None,
        }
    }

    fn into_request(self) -> Option<QueryRequest> {
        let targets = |ids: Vec<u32>| (!ids.is_empty()).then_some(ids);
        match self {
            Command::Lens {
                model,
                prompt,
                metric,
                position,
                targets: ids,
                top_k,
                grid,
            } => Some(QueryRequest::LogitLens(LensRequest {
                model,
                prompt,
                metric,
                token_position: position,
                target_ids: targets(ids),
                top_k,
                view: if grid { View::Grid } else { View::Line },
            })),
            Command::Patch {
                model,
                src,
                src_position,
                tgt,
                tgt_position,
                metric,
                targets: ids,
            } => Some(QueryRequest::ActivationPatching(PatchRequest {
                model,
                src_prompt: src,
                src_position,
                tgt_prompt: tgt,
                tgt_position,
                metric,
                target_ids: targets(ids),
            })),
            Command::Concept {
                model,
                prompt,
                position,
                targets: ids,
                top_k,
            } => Some(QueryRequest::ConceptLens(ConceptRequest {
                model,
                prompt,
                token_position: position,
                target_ids: targets(ids),
                top_k,
            })),
            Command::Models => None,
        }
    }
}

fn parse_position(s: &str) -> std::result::Result<TokenPosition, String> {
    if s.eq_ignore_ascii_case("last") {
        return Ok(TokenPosition::LAST);
    }
    s.parse::<i64>()
        .map(TokenPosition::Index)
        .map_err(|_| format!("expected an integer or \"last\", got '{s}'"))
}

fn load_config(path: Option<&PathBuf>, model: Option<&str>) -> Result<WorkbenchConfig> {
    let mut config = match path {
        Some(path) => WorkbenchConfig::load(path)?,
        None => {
            let mut config = WorkbenchConfig::default();
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config
        }
    };
    if let Some(name) = model {
        if config.model(name).is_none() {
            warn!("Model {} is not configured, treating it as an open hub model", name);
            config.models.push(ModelConfig {
                name: name.to_string(),
                repo: None,
                chat: false,
                gated: false,
                n_layers: 0,
                params: String::new(),
            });
        }
    }
    Ok(config)
}

/// Fleet where only `model` (or every model, for listings) is hot
fn local_fleet(config: &WorkbenchConfig, model: Option<&str>) -> StaticFleet {
    StaticFleet::from_config(config).retain(|name| model.map_or(true, |m| m == name))
}

/// In-process stand-in for the remote job API
async fn local_worker(
    config: &WorkbenchConfig,
    loader: &HubLoader,
    model: Option<&str>,
) -> Result<Arc<WorkerPool>> {
    let worker = Arc::new(WorkerPool::new(config.backend.max_retained_jobs));
    let Some(model) = model.and_then(|name| config.model(name)).cloned() else {
        return Ok(worker);
    };

    let loader = loader.clone();
    let settings = model.clone();
    let loaded = tokio::task::spawn_blocking(move || loader.load(&settings, true)).await??;
    let tracer = loaded
        .tracer
        .context("Loader returned no tracer for the worker")?;
    worker
        .serve(
            &model.name,
            tracer,
            loaded.codec,
            FleetModel {
                hot: true,
                gated: model.gated,
                n_layers: model.n_layers,
                params: model.params.clone(),
            },
        )
        .await;
    Ok(worker)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let model = cli.command.model().map(str::to_string);
    let config = Arc::new(load_config(cli.config.as_ref(), model.as_deref())?);
    let loader = HubLoader::new(cli.cpu);
    let caller = cli.caller.as_deref();

    let (execution, registry) = match config.backend.mode {
        ExecutionMode::Local => {
            // Listing only needs tokenizers
            let load_tracers = model.is_some();
            let fleet = Arc::new(local_fleet(&config, model.as_deref()));
            let registry = ModelRegistry::new(
                config.clone(),
                Arc::new(loader.clone()),
                fleet,
                load_tracers,
            );
            (Execution::Local, registry)
        }
        ExecutionMode::Remote => match &config.backend.host {
            Some(host) => {
                info!("Remote execution via {}", host);
                let executor = Arc::new(HttpExecutor::from_config(&config.backend)?);
                let registry = ModelRegistry::new(
                    config.clone(),
                    Arc::new(loader.clone()),
                    executor.clone(),
                    false,
                );
                (Execution::Remote(executor), registry)
            }
            None => {
                info!("Remote execution on an in-process worker");
                let worker = local_worker(&config, &loader, model.as_deref()).await?;
                let registry = ModelRegistry::new(
                    config.clone(),
                    Arc::new(loader.clone()),
                    worker.clone(),
                    false,
                );
                (Execution::Remote(worker), registry)
            }
        },
    };

    let bench = Workbench::new(Arc::new(registry), execution, Arc::new(TracingSink));

    let Some(request) = cli.command.into_request() else {
        let models = bench.list_models(caller).await;
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    };

    let data = match bench.start_query(caller, &request).await? {
        QueryStart::Complete { data } => data,
        QueryStart::Pending { job_id } => {
            info!("Job {} submitted, collecting...", job_id);
            bench.collect_query(caller, &job_id, &request).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&data)?);

    Ok(())
}
