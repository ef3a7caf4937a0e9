//! LLaMA forward pass with per-layer decoding
//!
//! Runs layer-by-layer so every residual stream can be decoded through the
//! final norm and unembedding, patched, or projected through attention-head
//! OV circuits.
//!
//! Covers the LLaMA family:
//! - No bias on any projection (Q, K, V, O, MLP)
//! - Grouped-query attention (`num_key_value_heads <= num_attention_heads`)
//! - Separate or tied `lm_head`

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::masks::create_causal_mask;
use crate::registry::{LoadedModel, ModelLoader};
use crate::tokenizer::load_hub_tokenizer;
use crate::tracer::{argmax_first, ConceptHead, LayerSeries, PatchTrace, Tracer};

/// Model configuration (matches HuggingFace config.json for LLaMA models)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Absent in older checkpoints, which use full multi-head attention
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary Position Embeddings (RoPE), half-split layout
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [seq_len, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;

        Ok(Self { cos, sin })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;

        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;

        Ok((q_embed, k_embed))
    }
}

/// Multi-head attention (no bias on any projection)
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let q_proj = linear_no_bias(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_no_bias(
            config.hidden_size,
            config.num_kv_heads() * head_dim,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_no_bias(
            config.hidden_size,
            config.num_kv_heads() * head_dim,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        // transpose leaves a strided layout when n_rep == 1
        let q = q.contiguous()?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }

    /// `O[:, head] · V[kv_head, :]`, shape `[hidden, hidden]`
    fn ov_circuit(&self, head: usize) -> Result<Tensor> {
        anyhow::ensure!(
            head < self.num_heads,
            "Head {head} out of range (model has {} heads)",
            self.num_heads
        );
        let group = self.num_heads / self.num_kv_heads;
        let o = self
            .o_proj
            .weight()
            .narrow(1, head * self.head_dim, self.head_dim)?
            .contiguous()?;
        let v = self
            .v_proj
            .weight()
            .narrow(0, (head / group) * self.head_dim, self.head_dim)?
            .contiguous()?;
        Ok(o.matmul(&v)?)
    }
}

/// Repeat KV heads for grouped query attention
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// MLP block (SwiGLU, no bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let gate_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("gate_proj"),
        )?;
        let up_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("up_proj"),
        )?;
        let down_proj = linear_no_bias(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("down_proj"),
        )?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), config)?;
        let mlp = MLP::load(vb.pp("mlp"), config)?;
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// LLaMA model exposing every layer's residual stream
pub struct LlamaTracer {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    device: Device,
}

impl LlamaTracer {
    /// Download (or reuse the hub cache of) `model_id` and memory-map its weights
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            let path = repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        // SAFETY: the hub cache files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_var_builder(vb, config)
    }

    /// Build the model from any weight source laid out like HF LLaMA checkpoints
    pub fn from_var_builder(vb: VarBuilder, config: LlamaConfig) -> Result<Self> {
        anyhow::ensure!(
            config.num_attention_heads % config.num_kv_heads() == 0,
            "{} attention heads cannot be grouped over {} KV heads",
            config.num_attention_heads,
            config.num_kv_heads()
        );
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            info!("Using tied embeddings for lm_head");
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            &device,
            dtype,
        )?;

        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            device,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Residual stream after the embedding and after every layer, each `[1, seq, hidden]`
    fn residuals(&self, input_ids: &[u32]) -> Result<Vec<Tensor>> {
        anyhow::ensure!(!input_ids.is_empty(), "Cannot trace an empty prompt");
        anyhow::ensure!(
            input_ids.len() <= self.config.max_position_embeddings,
            "Prompt has {} tokens, model supports at most {}",
            input_ids.len(),
            self.config.max_position_embeddings
        );

        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let mut hidden = self.embed_tokens.forward(&input)?;
        let mut streams = Vec::with_capacity(self.layers.len() + 1);
        streams.push(hidden.clone());

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary)?;
            streams.push(hidden.clone());

            if (i + 1) % 10 == 0 {
                debug!("Processed layer {}/{}", i + 1, self.layers.len());
            }
        }
        Ok(streams)
    }

    /// Final norm + lm_head, as F32 logits
    fn decode(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(hidden)?;
        Ok(self.lm_head.forward(&normed)?.to_dtype(DType::F32)?)
    }

    /// Top prediction at the last position of a residual stream
    fn last_prediction(&self, hidden: &Tensor) -> Result<u32> {
        let last = hidden.dim(1)? - 1;
        let logits: Vec<f32> = self.decode(&hidden.narrow(1, last, 1)?)?.flatten_all()?.to_vec1()?;
        Ok(argmax_first(&logits))
    }

    /// Summed OV circuits of `heads`, `[hidden, hidden]`
    fn concept_projection(&self, heads: &[ConceptHead]) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for head in heads {
            let layer = self.layers.get(head.layer).ok_or_else(|| {
                anyhow::anyhow!(
                    "Concept head layer {} out of range (model has {} layers)",
                    head.layer,
                    self.layers.len()
                )
            })?;
            let ov = layer.self_attn.ov_circuit(head.head)?;
            total = Some(match total {
                Some(sum) => (sum + ov)?,
                None => ov,
            });
        }
        total.ok_or_else(|| anyhow::anyhow!("No concept heads given"))
    }
}

/// `hidden` with position `position` replaced by `donor` (`[1, 1, hidden]`)
fn replace_position(hidden: &Tensor, position: usize, donor: &Tensor) -> Result<Tensor> {
    let seq_len = hidden.dim(1)?;
    anyhow::ensure!(position < seq_len, "Position {position} out of range for {seq_len} tokens");

    let mut parts = Vec::with_capacity(3);
    if position > 0 {
        parts.push(hidden.narrow(1, 0, position)?);
    }
    parts.push(donor.clone());
    if position + 1 < seq_len {
        parts.push(hidden.narrow(1, position + 1, seq_len - position - 1)?);
    }
    Ok(Tensor::cat(&parts, 1)?)
}

impl Tracer for LlamaTracer {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn trace(&self, input_ids: &[u32]) -> Result<LayerSeries> {
        let layers = self
            .residuals(input_ids)?
            .iter()
            .map(|hidden| self.decode(hidden))
            .collect::<Result<Vec<_>>>()?;
        LayerSeries::new(layers)
    }

    fn trace_patched(
        &self,
        source_ids: &[u32],
        source_position: usize,
        target_ids: &[u32],
        target_position: usize,
    ) -> Result<PatchTrace> {
        anyhow::ensure!(
            source_position < source_ids.len(),
            "Source position {source_position} out of range"
        );
        let source = self.residuals(source_ids)?;
        let target = self.residuals(target_ids)?;
        let last = target_ids.len() - 1;

        let source_prediction = self.last_prediction(&source[source.len() - 1])?;
        let target_prediction = self.last_prediction(&target[target.len() - 1])?;

        let mut entries = Vec::with_capacity(self.layers.len());
        for layer in 0..self.layers.len() {
            let donor = source[layer + 1].narrow(1, source_position, 1)?;
            let mut hidden = replace_position(&target[layer + 1], target_position, &donor)?;
            for later in &self.layers[layer + 1..] {
                hidden = later.forward(&hidden, &self.rotary)?;
            }
            entries.push(self.decode(&hidden.narrow(1, last, 1)?)?);
        }
        debug!("Patched {} layers", entries.len());

        Ok(PatchTrace {
            series: LayerSeries::new(entries)?,
            source_prediction,
            target_prediction,
        })
    }

    fn trace_concept(
        &self,
        input_ids: &[u32],
        position: usize,
        heads: &[ConceptHead],
    ) -> Result<LayerSeries> {
        anyhow::ensure!(position < input_ids.len(), "Position {position} out of range");
        let projection = self.concept_projection(heads)?.t()?.contiguous()?;

        let layers = self.residuals(input_ids)?[1..]
            .iter()
            .map(|hidden| {
                let state = hidden.narrow(1, position, 1)?.squeeze(0)?;
                let projected = state.matmul(&projection)?.unsqueeze(0)?;
                self.decode(&projected)
            })
            .collect::<Result<Vec<_>>>()?;
        LayerSeries::new(layers)
    }
}

/// CUDA with BF16 when available, otherwise CPU with F32
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            // F16 loses range on bf16-trained checkpoints
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Loads tokenizers (and tracers for local execution) from the HuggingFace hub
#[derive(Debug, Clone, Default)]
pub struct HubLoader {
    force_cpu: bool,
}

impl HubLoader {
    pub fn new(force_cpu: bool) -> Self {
        Self { force_cpu }
    }
}

impl ModelLoader for HubLoader {
    fn load(&self, model: &ModelConfig, with_tracer: bool) -> Result<LoadedModel> {
        let repo_id = model.repo_id();
        let codec = Arc::new(load_hub_tokenizer(repo_id)?);

        let tracer: Option<Arc<dyn Tracer>> = if with_tracer {
            let (device, dtype) = select_device(self.force_cpu);
            let tracer = LlamaTracer::load(repo_id, &device, dtype)?;
            if tracer.n_layers() != model.n_layers {
                warn!(
                    "Model {} is configured with {} layers but has {}",
                    model.name,
                    model.n_layers,
                    tracer.n_layers()
                );
            }
            Some(Arc::new(tracer))
        } else {
            None
        };

        Ok(LoadedModel { tracer, codec })
    }
}
