//! Scripted capabilities for tests and offline runs
//!
//! Nothing here touches model weights or the network: [`ScriptedTracer`]
//! produces deterministic logits, [`WordCodec`] maps whitespace-separated
//! words to ids, and the fleet, loader and sink doubles record how they
//! were used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use candle_core::{Device, Tensor};

use crate::config::ModelConfig;
use crate::registry::{FleetModel, FleetSource, FleetStatus, LoadedModel, ModelLoader};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::tokenizer::TokenCodec;
use crate::tracer::{ConceptHead, LayerSeries, PatchTrace, Tracer};

/// Deterministic tracer
///
/// At every position the model "predicts" the next vocabulary id after the
/// input token. Early layers favor token 0 instead; the preference moves to
/// the prediction from the middle layer on, so ranks change across layers.
pub struct ScriptedTracer {
    n_layers: usize,
    vocab_size: usize,
    interventions: bool,
    trace_calls: AtomicUsize,
}

impl ScriptedTracer {
    pub fn new(n_layers: usize, vocab_size: usize) -> Self {
        Self {
            n_layers,
            vocab_size,
            interventions: true,
            trace_calls: AtomicUsize::new(0),
        }
    }

    /// Use the default "unsupported" patching and concept capabilities
    pub fn without_interventions(mut self) -> Self {
        self.interventions = false;
        self
    }

    /// Number of trace calls of any kind
    pub fn trace_calls(&self) -> usize {
        self.trace_calls.load(Ordering::SeqCst)
    }

    fn predicted(&self, token: u32) -> u32 {
        (token + 1) % self.vocab_size as u32
    }

    /// Logits of layer entry `layer` for a position whose prediction is `favored`
    fn row(&self, layer: usize, favored: u32) -> Vec<f32> {
        let late = 2 * layer >= self.n_layers;
        (0..self.vocab_size)
            .map(|v| {
                let mut logit = -0.01 * v as f32;
                if v as u32 == favored {
                    logit += if late { 2.0 + layer as f32 } else { 1.0 };
                }
                if v == 0 && !late {
                    logit += 1.5;
                }
                logit
            })
            .collect()
    }

    fn entry(&self, layer: usize, favored: &[u32]) -> Result<Tensor> {
        let data: Vec<f32> = favored.iter().flat_map(|&f| self.row(layer, f)).collect();
        Ok(Tensor::from_vec(
            data,
            (favored.len(), self.vocab_size),
            &Device::Cpu,
        )?)
    }

    fn ensure_interventions(&self, what: &str) -> Result<()> {
        anyhow::ensure!(self.interventions, "{what} not supported for this model");
        Ok(())
    }
}

impl Tracer for ScriptedTracer {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn trace(&self, input_ids: &[u32]) -> Result<LayerSeries> {
        self.trace_calls.fetch_add(1, Ordering::SeqCst);
        let favored: Vec<u32> = input_ids.iter().map(|&t| self.predicted(t)).collect();
        let layers = (0..=self.n_layers)
            .map(|layer| self.entry(layer, &favored))
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
        self.ensure_interventions("Activation patching")?;
        self.trace_calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(source_position < source_ids.len(), "source position out of range");
        anyhow::ensure!(target_position < target_ids.len(), "target position out of range");

        let source_prediction = self.predicted(source_ids[source_ids.len() - 1]);
        let target_prediction = self.predicted(target_ids[target_ids.len() - 1]);
        // Patching early layers carries the source answer through
        let layers = (0..self.n_layers)
            .map(|layer| {
                let favored = if 2 * layer < self.n_layers {
                    source_prediction
                } else {
                    target_prediction
                };
                self.entry(self.n_layers, &[favored])
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PatchTrace {
            series: LayerSeries::new(layers)?,
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
        self.ensure_interventions("Concept lens")?;
        self.trace_calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(position < input_ids.len(), "position out of range");

        let shift = heads.len() as u32;
        let favored = (self.predicted(input_ids[position]) + shift) % self.vocab_size as u32;
        let layers = (0..self.n_layers)
            .map(|layer| self.entry(layer, &[favored]))
            .collect::<Result<Vec<_>>>()?;
        LayerSeries::new(layers)
    }
}

/// Whitespace word codec over a fixed vocabulary
///
/// The first word is the beginning-of-sequence token and is prepended to
/// every encoding.
#[derive(Debug, Clone)]
pub struct WordCodec {
    words: Vec<String>,
    ids: HashMap<String, u32>,
}

impl WordCodec {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        let ids = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Self { words, ids }
    }

    pub fn vocab_size(&self) -> usize {
        self.words.len()
    }
}

impl TokenCodec for WordCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![0];
        for word in text.split_whitespace() {
            let id = self
                .ids
                .get(word)
                .ok_or_else(|| anyhow::anyhow!("Unknown word '{word}'"))?;
            ids.push(*id);
        }
        Ok(ids)
    }

    fn decode(&self, id: u32) -> String {
        self.words
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| format!("<{id}>"))
    }
}

/// Fleet status that tests can change, counting every poll
#[derive(Default)]
pub struct ScriptedFleet {
    status: Mutex<FleetStatus>,
    polls: AtomicUsize,
    failing: Mutex<bool>,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, model: FleetModel) {
        if let Ok(mut status) = self.status.lock() {
            status.insert(name.to_string(), model);
        }
    }

    /// Mark `name` hot or cold, keeping its other fields
    pub fn set_hot(&self, name: &str, hot: bool) {
        if let Ok(mut status) = self.status.lock() {
            status.entry(name.to_string()).or_default().hot = hot;
        }
    }

    /// Make subsequent polls fail
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FleetSource for ScriptedFleet {
    async fn fleet_status(&self) -> Result<FleetStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing.lock().map(|f| *f).unwrap_or(false);
        anyhow::ensure!(!failing, "fleet status unavailable");
        self.status
            .lock()
            .map(|s| s.clone())
            .map_err(|_| anyhow::anyhow!("fleet status lock poisoned"))
    }
}

/// Loader that serves [`ScriptedTracer`]s and one shared [`WordCodec`]
pub struct StaticLoader {
    codec: Arc<WordCodec>,
    vocab_size: usize,
    loads: AtomicUsize,
    tracers: Mutex<HashMap<String, Arc<ScriptedTracer>>>,
}

impl StaticLoader {
    pub fn new(codec: WordCodec) -> Self {
        let vocab_size = codec.vocab_size();
        Self {
            codec: Arc::new(codec),
            vocab_size,
            loads: AtomicUsize::new(0),
            tracers: Mutex::new(HashMap::new()),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// The tracer handed out for `model`, if it was loaded
    pub fn tracer(&self, model: &str) -> Option<Arc<ScriptedTracer>> {
        self.tracers.lock().ok()?.get(model).cloned()
    }
}

impl ModelLoader for StaticLoader {
    fn load(&self, model: &ModelConfig, with_tracer: bool) -> Result<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let tracer = if with_tracer {
            let tracer = Arc::new(ScriptedTracer::new(model.n_layers, self.vocab_size));
            self.tracers
                .lock()
                .map_err(|_| anyhow::anyhow!("loader lock poisoned"))?
                .insert(model.name.clone(), tracer.clone());
            Some(tracer as Arc<dyn Tracer>)
        } else {
            None
        };
        Ok(LoadedModel {
            tracer,
            codec: self.codec.clone(),
        })
    }
}

/// Sink that keeps every event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_trace_shape_and_prediction() {
        let tracer = ScriptedTracer::new(4, 6);
        let series = tracer.trace(&[0, 2, 5]).unwrap();

        assert_eq!(series.len(), 5);
        assert_eq!(series.seq_len(), 3);
        assert_eq!(series.top_predictions().unwrap(), vec![1, 3, 0]);
        assert_eq!(tracer.trace_calls(), 1);
    }

    #[test]
    fn test_early_layers_prefer_token_zero() {
        let tracer = ScriptedTracer::new(4, 6);
        let series = tracer.trace(&[2]).unwrap();
        let first = LayerSeries::new(vec![series.layers()[0].clone()]).unwrap();
        assert_eq!(first.top_predictions().unwrap(), vec![0]);
    }

    #[test]
    fn test_word_codec_round_trip() {
        let codec = WordCodec::new(["<s>", "The", "cat"]);
        assert_eq!(codec.encode("The cat").unwrap(), vec![0, 1, 2]);
        assert_eq!(codec.decode_each(&[2, 9]), vec!["cat", "<9>"]);
        assert!(codec.encode("dog").is_err());
    }
}
