//! KV-cache for incremental decoding.
//!
//! The first forward call fills every layer with the keys/values of the
//! whole prompt. Later calls append the single newest position, so each step
//! only computes attention state for one token.

use crate::error::{DecodeError, DecodeResult};
use ndarray::{Array3, ArrayView3, Axis};

#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached keys per layer: (batch=1, covered_len, kv_dim)
    keys: Vec<Array3<f32>>,
    /// Cached values per layer: (batch=1, covered_len, kv_dim)
    values: Vec<Array3<f32>>,
    kv_dim: usize,
    max_len: usize,
}

impl KVCache {
    pub fn new(n_layers: usize, max_len: usize, kv_dim: usize) -> Self {
        let keys = (0..n_layers)
            .map(|_| Array3::<f32>::zeros((1, 0, kv_dim)))
            .collect();
        let values = (0..n_layers)
            .map(|_| Array3::<f32>::zeros((1, 0, kv_dim)))
            .collect();

        Self {
            keys,
            values,
            kv_dim,
            max_len,
        }
    }

    /// True until the first forward call has filled the cache.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of positions covered, taken from the first layer.
    pub fn len(&self) -> usize {
        self.keys.first().map_or(0, |k| k.dim().1)
    }

    /// Length covered by one layer; layers lag behind the first one while a
    /// forward call is in progress.
    pub fn layer_len(&self, layer: usize) -> usize {
        self.keys.get(layer).map_or(0, |k| k.dim().1)
    }

    pub fn num_layers(&self) -> usize {
        self.keys.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Append new keys/values for `layer` and return everything cached for it.
    ///
    /// `new_keys`, `new_values`: (batch=1, new_len, kv_dim)
    pub fn append_layer(
        &mut self,
        layer: usize,
        new_keys: ArrayView3<'_, f32>,
        new_values: ArrayView3<'_, f32>,
    ) -> DecodeResult<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        if layer >= self.keys.len() {
            return Err(DecodeError::shape(format!(
                "layer {} out of range for cache with {} layers",
                layer,
                self.keys.len()
            )));
        }
        if new_keys.dim() != new_values.dim() {
            return Err(DecodeError::shape(format!(
                "keys {:?} and values {:?} differ in shape",
                new_keys.dim(),
                new_values.dim()
            )));
        }
        let (batch, new_len, kv_dim) = new_keys.dim();
        if batch != 1 || kv_dim != self.kv_dim {
            return Err(DecodeError::shape(format!(
                "expected (1, _, {}) keys, got {:?}",
                self.kv_dim,
                new_keys.dim()
            )));
        }
        let required = self.layer_len(layer) + new_len;
        if required > self.max_len {
            return Err(DecodeError::ContextOverflow {
                required,
                max: self.max_len,
            });
        }

        self.keys[layer].append(Axis(1), new_keys)?;
        self.values[layer].append(Axis(1), new_values)?;

        Ok((self.keys[layer].view(), self.values[layer].view()))
    }

    /// Bytes per token for this cache
    pub fn bytes_per_token(&self) -> usize {
        // 2 (K+V) * n_layers * kv_dim * sizeof(f32)
        2 * self.keys.len() * self.kv_dim * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cache = KVCache::new(2, 128, 64);
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.num_layers(), 2);
    }

    #[test]
    fn prefill_then_decode() {
        let mut cache = KVCache::new(2, 128, 64);

        // Prefill: 10 tokens on every layer
        let prefill = Array3::<f32>::ones((1, 10, 64));
        for layer in 0..2 {
            let (k, v) = cache
                .append_layer(layer, prefill.view(), prefill.view())
                .expect("prefill append");
            assert_eq!(k.dim(), (1, 10, 64));
            assert_eq!(v.dim(), (1, 10, 64));
        }
        assert_eq!(cache.len(), 10);
        assert!(!cache.is_empty());

        // Decode: 1 token
        let step = Array3::<f32>::from_elem((1, 1, 64), 2.0);
        for layer in 0..2 {
            let (k, _) = cache
                .append_layer(layer, step.view(), step.view())
                .expect("decode append");
            assert_eq!(k.dim(), (1, 11, 64));
            assert_eq!(k[[0, 10, 0]], 2.0);
            assert_eq!(k[[0, 9, 0]], 1.0);
        }
        assert_eq!(cache.len(), 11);
    }

    #[test]
    fn overflow_is_reported() {
        let mut cache = KVCache::new(1, 4, 2);
        let block = Array3::<f32>::zeros((1, 3, 2));
        cache
            .append_layer(0, block.view(), block.view())
            .expect("fits");
        let err = cache
            .append_layer(0, block.view(), block.view())
            .expect_err("overflow");
        assert!(matches!(
            err,
            DecodeError::ContextOverflow { required: 6, max: 4 }
        ));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut cache = KVCache::new(1, 16, 4);
        let wrong_dim = Array3::<f32>::zeros((1, 1, 3));
        assert!(cache
            .append_layer(0, wrong_dim.view(), wrong_dim.view())
            .is_err());
        let ok = Array3::<f32>::zeros((1, 1, 4));
        assert!(cache.append_layer(1, ok.view(), ok.view()).is_err());
    }

    #[test]
    fn bytes_per_token() {
        let cache = KVCache::new(12, 1024, 768);
        // 2 * 12 layers * 768 * 4 bytes = 73728 bytes/token
        assert_eq!(cache.bytes_per_token(), 73728);
    }
}
