//! Causal attention masks
//!
//! Masks are cached by `(seq_len, device, dtype)`; every layer of every
//! trace of the same prompt length reuses one tensor (clones are Arc bumps).
//! The cache holds at most [`MAX_CACHED_MASKS`] masks and evicts the least
//! recently used one first.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex};

/// Distinct prompt lengths kept alive at once
pub const MAX_CACHED_MASKS: usize = 32;

type MaskKey = (usize, usize, DType);

/// Bounded mask store, least recently used at the front of `order`
struct MaskCache {
    capacity: usize,
    masks: HashMap<MaskKey, Tensor>,
    order: VecDeque<MaskKey>,
}

impl MaskCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            masks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: MaskKey) {
        self.order.retain(|k| *k != key);
        self.order.push_back(key);
    }

    fn get(&mut self, key: MaskKey) -> Option<Tensor> {
        let mask = self.masks.get(&key).cloned()?;
        self.touch(key);
        Some(mask)
    }

    fn insert(&mut self, key: MaskKey, mask: Tensor) {
        self.masks.insert(key, mask);
        self.touch(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.masks.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.masks.len()
    }

    #[cfg(test)]
    fn contains(&self, key: MaskKey) -> bool {
        self.masks.contains_key(&key)
    }
}

static CAUSAL_MASK_CACHE: LazyLock<Mutex<MaskCache>> =
    LazyLock::new(|| Mutex::new(MaskCache::new(MAX_CACHED_MASKS)));

/// Device kind for the cache key; one device per kind is assumed
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Cached causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// `0.0` where position `j <= i` may be attended, `-inf` elsewhere:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("mask cache lock poisoned"))?
        .get(cache_key)
    {
        return Ok(cached);
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("mask cache lock poisoned"))?
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}
