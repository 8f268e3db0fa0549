//! # scout-kv
//!
//! Key/value working state for scout's attention layers.
//!
//! Supports:
//! - **Prefill**: Writes K/V for a run of tokens `[seq_len, n_kv_heads, head_dim]`
//! - **Decode**: Appends K/V for one token at a time, tracking cumulative sequence length
//! - **Truncation**: Drops positions past a prefix so a new prompt sharing that
//!   prefix reuses the already-computed entries
//! - **Multi-layer**: SessionKVCache manages K/V for all layers with synchronized seq_len
//! - **Memory tracking**: Byte accounting for both allocated and active memory
//!
//! The cache never evicts on its own. Appending past capacity is an error and
//! the caller decides which history to drop.

use std::fmt;

/// Represents tensor shape: `[seq_len, n_heads, head_dim]`.
///
/// Used for shape validation and memory calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub seq_len: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(seq_len: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            seq_len,
            n_heads,
            head_dim,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.seq_len * self.n_heads * self.head_dim
    }

    pub fn capacity_bytes(&self, bytes_per_element: usize) -> usize {
        self.total_elements() * bytes_per_element
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[seq:{}, heads:{}, dim:{}]",
            self.seq_len, self.n_heads, self.head_dim
        )
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Invalid cache geometry: {0}")]
    InvalidGeometry(String),
}

pub type KVResult<T> = Result<T, KVError>;

/// Single layer's K and V cache.
///
/// # Invariants
/// - All operations maintain `seq_len <= capacity`
/// - K and V tensors are always same size
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// K tensor, flattened `[capacity, n_heads, head_dim]`
    k: Vec<f32>,
    /// V tensor, flattened `[capacity, n_heads, head_dim]`
    v: Vec<f32>,

    /// Maximum seq_len this layer can hold
    pub capacity: usize,
    /// Key/value heads (fewer than query heads under grouped-query attention)
    pub n_heads: usize,
    pub head_dim: usize,
    /// How many positions are currently written
    pub seq_len: usize,
}

impl LayerKVCache {
    pub fn new(max_seq_len: usize, n_heads: usize, head_dim: usize) -> Self {
        let buf_len = max_seq_len * n_heads * head_dim;

        Self {
            k: vec![0.0; buf_len],
            v: vec![0.0; buf_len],
            capacity: max_seq_len,
            n_heads,
            head_dim,
            seq_len: 0,
        }
    }

    fn stride(&self) -> usize {
        self.n_heads * self.head_dim
    }

    fn check_token_shape(&self, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        let expected = self.stride();
        if k_token.len() != expected || v_token.len() != expected {
            let got = if k_token.len() != expected {
                k_token.len()
            } else {
                v_token.len()
            };
            return Err(KVError::ShapeMismatch { expected, got });
        }
        Ok(())
    }

    /// Append K and V for a single decode token, each `[n_heads, head_dim]`.
    ///
    /// # Errors
    /// - `CapacityExceeded`: If appending would exceed max sequence length
    /// - `ShapeMismatch`: If token shape doesn't match n_heads * head_dim
    pub fn append_token(&mut self, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        self.check_token_shape(k_token, v_token)?;

        if self.seq_len >= self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + 1,
                max: self.capacity,
            });
        }

        let stride = self.stride();
        let offset = self.seq_len * stride;
        self.k[offset..offset + stride].copy_from_slice(k_token);
        self.v[offset..offset + stride].copy_from_slice(v_token);
        self.seq_len += 1;

        Ok(())
    }

    /// Append K and V for a run of tokens after the current contents.
    pub fn write_prefill(&mut self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<()> {
        let stride = self.stride();
        if k_seq.len() != v_seq.len() || k_seq.len() % stride != 0 {
            return Err(KVError::ShapeMismatch {
                expected: k_seq.len() - k_seq.len() % stride,
                got: if k_seq.len() % stride != 0 {
                    k_seq.len()
                } else {
                    v_seq.len()
                },
            });
        }

        let prefill_len = k_seq.len() / stride;
        if self.seq_len + prefill_len > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + prefill_len,
                max: self.capacity,
            });
        }

        let offset = self.seq_len * stride;
        self.k[offset..offset + k_seq.len()].copy_from_slice(k_seq);
        self.v[offset..offset + v_seq.len()].copy_from_slice(v_seq);
        self.seq_len += prefill_len;

        Ok(())
    }

    /// Written keys, `[seq_len, n_heads, head_dim]`.
    pub fn keys(&self) -> &[f32] {
        &self.k[..self.seq_len * self.stride()]
    }

    /// Written values, `[seq_len, n_heads, head_dim]`.
    pub fn values(&self) -> &[f32] {
        &self.v[..self.seq_len * self.stride()]
    }

    /// Key vector of one head at one position.
    pub fn key(&self, pos: usize, head: usize) -> &[f32] {
        let start = pos * self.stride() + head * self.head_dim;
        &self.keys()[start..start + self.head_dim]
    }

    /// Value vector of one head at one position.
    pub fn value(&self, pos: usize, head: usize) -> &[f32] {
        let start = pos * self.stride() + head * self.head_dim;
        &self.values()[start..start + self.head_dim]
    }

    /// Keep only the first `len` positions. No-op when `len >= seq_len`.
    pub fn truncate(&mut self, len: usize) {
        self.seq_len = self.seq_len.min(len);
    }

    /// Clear the cache (reset seq_len to 0).
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }

    pub fn shape(&self) -> KVShape {
        KVShape::new(self.seq_len, self.n_heads, self.head_dim)
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        (self.k.len() + self.v.len()) * std::mem::size_of::<f32>()
    }

    /// Memory used by written positions (K+V).
    pub fn active_memory_bytes(&self) -> usize {
        self.shape().capacity_bytes(std::mem::size_of::<f32>()) * 2
    }
}

/// Session-level KV cache managing all layers.
///
/// Ensures all layers maintain synchronized `seq_len`.
#[derive(Debug, Clone)]
pub struct SessionKVCache {
    layers: Vec<LayerKVCache>,
    // Positions written to every layer.
    committed: usize,
}

impl SessionKVCache {
    pub fn new(
        n_layers: usize,
        max_seq_len: usize,
        n_heads: usize,
        head_dim: usize,
    ) -> KVResult<Self> {
        if n_layers == 0 || n_heads == 0 || head_dim == 0 {
            return Err(KVError::InvalidGeometry(format!(
                "layers={n_layers}, heads={n_heads}, head_dim={head_dim}"
            )));
        }
        let layers = (0..n_layers)
            .map(|_| LayerKVCache::new(max_seq_len, n_heads, head_dim))
            .collect();

        Ok(Self {
            layers,
            committed: 0,
        })
    }

    /// Bytes a cache with this geometry allocates, without allocating it.
    pub fn estimate_bytes(n_layers: usize, max_seq_len: usize, n_heads: usize, head_dim: usize) -> u64 {
        let per_layer = KVShape::new(max_seq_len, n_heads, head_dim)
            .capacity_bytes(std::mem::size_of::<f32>()) as u64
            * 2;
        per_layer * n_layers as u64
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&LayerKVCache> {
        self.layers.get(layer_idx)
    }

    /// Current sequence length, shared by all layers. Excludes a staged
    /// position that has not been committed.
    pub fn seq_len(&self) -> usize {
        self.committed
    }

    pub fn capacity(&self) -> usize {
        self.layers.first().map_or(0, |l| l.capacity)
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Append K/V for one token to all layers.
    ///
    /// All layers are validated before any is written, so a failed append
    /// leaves every layer unchanged.
    pub fn append_token(&mut self, k_tokens: &[&[f32]], v_tokens: &[&[f32]]) -> KVResult<()> {
        if k_tokens.len() != self.layers.len() || v_tokens.len() != self.layers.len() {
            let got = if k_tokens.len() != self.layers.len() {
                k_tokens.len()
            } else {
                v_tokens.len()
            };
            return Err(KVError::ShapeMismatch {
                expected: self.layers.len(),
                got,
            });
        }

        for (i, layer) in self.layers.iter().enumerate() {
            layer.check_token_shape(k_tokens[i], v_tokens[i])?;
            if layer.seq_len >= layer.capacity {
                return Err(KVError::CapacityExceeded {
                    seq_len: layer.seq_len + 1,
                    max: layer.capacity,
                });
            }
        }

        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.append_token(k_tokens[i], v_tokens[i])?;
        }
        self.committed += 1;

        Ok(())
    }

    /// Write one layer's entry for the position `seq_len()` without
    /// advancing the shared length. Call [`SessionKVCache::commit`] once every
    /// layer has been written.
    ///
    /// A layer's K/V for the new position is visible through
    /// [`SessionKVCache::layer`] as soon as it is staged, so attention in that
    /// layer can include the current token.
    pub fn stage(&mut self, layer_idx: usize, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        let pos = self.seq_len();
        let n_layers = self.layers.len();
        let layer = self.layers.get_mut(layer_idx).ok_or(KVError::ShapeMismatch {
            expected: n_layers,
            got: layer_idx + 1,
        })?;
        if layer.seq_len != pos {
            return Err(KVError::InvalidGeometry(format!(
                "layer {layer_idx} already staged at position {pos}"
            )));
        }
        layer.append_token(k_token, v_token)
    }

    /// Finish a staged position. Every layer must have been staged;
    /// otherwise the partial position is discarded.
    pub fn commit(&mut self) -> KVResult<()> {
        let target = self.committed + 1;
        if self.layers.iter().any(|l| l.seq_len != target) {
            self.discard_staged();
            return Err(KVError::InvalidGeometry(
                "commit with unstaged layers".to_string(),
            ));
        }
        self.committed = target;
        Ok(())
    }

    /// Drop a partially staged position.
    pub fn discard_staged(&mut self) {
        let len = self.committed;
        for layer in &mut self.layers {
            layer.truncate(len);
        }
    }

    /// Keep only the first `len` positions in every layer.
    pub fn truncate(&mut self, len: usize) {
        self.committed = self.committed.min(len);
        let len = self.committed;
        for layer in &mut self.layers {
            layer.truncate(len);
        }
    }

    pub fn clear(&mut self) {
        self.committed = 0;
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Total memory across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }

    /// Active memory across all layers (based on seq_len).
    pub fn active_memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.active_memory_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_shape_total_elements() {
        let shape = KVShape::new(128, 8, 64);
        assert_eq!(shape.total_elements(), 128 * 8 * 64);
        assert_eq!(shape.to_string(), "[seq:128, heads:8, dim:64]");
    }

    #[test]
    fn layer_append_single_token() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        cache.append_token(&[0.1; 8], &[0.2; 8]).unwrap();
        assert_eq!(cache.seq_len, 1);
        assert_eq!(cache.keys().len(), 8);
    }

    #[test]
    fn layer_capacity_exceeded() {
        let mut cache = LayerKVCache::new(2, 2, 4);
        cache.append_token(&[0.1; 8], &[0.2; 8]).unwrap();
        cache.append_token(&[0.1; 8], &[0.2; 8]).unwrap();

        let result = cache.append_token(&[0.1; 8], &[0.2; 8]);
        assert_eq!(
            result,
            Err(KVError::CapacityExceeded { seq_len: 3, max: 2 })
        );
    }

    #[test]
    fn layer_shape_mismatch_on_append() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        let result = cache.append_token(&[0.1; 8], &[0.2; 7]);
        assert_eq!(result, Err(KVError::ShapeMismatch { expected: 8, got: 7 }));
    }

    #[test]
    fn layer_prefill_appends_after_existing() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        cache.append_token(&[1.0; 8], &[1.0; 8]).unwrap();
        cache.write_prefill(&[2.0; 16], &[3.0; 16]).unwrap();
        assert_eq!(cache.seq_len, 3);
        assert_eq!(cache.key(0, 1), &[1.0; 4]);
        assert_eq!(cache.key(2, 0), &[2.0; 4]);
        assert_eq!(cache.value(1, 1), &[3.0; 4]);
    }

    #[test]
    fn layer_prefill_rejects_partial_token() {
        let mut cache = LayerKVCache::new(10, 2, 4);
        assert!(matches!(
            cache.write_prefill(&[0.0; 12], &[0.0; 12]),
            Err(KVError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn layer_truncate_keeps_prefix() {
        let mut cache = LayerKVCache::new(10, 1, 2);
        for i in 0..5 {
            cache.append_token(&[i as f32; 2], &[i as f32; 2]).unwrap();
        }
        cache.truncate(3);
        assert_eq!(cache.seq_len, 3);
        cache.truncate(7);
        assert_eq!(cache.seq_len, 3);
        cache.append_token(&[9.0; 2], &[9.0; 2]).unwrap();
        assert_eq!(cache.key(3, 0), &[9.0, 9.0]);
        assert_eq!(cache.key(2, 0), &[2.0, 2.0]);
    }

    #[test]
    fn layer_memory_bytes_calculation() {
        let cache = LayerKVCache::new(10, 2, 4);
        let expected_bytes = 2 * 80 * std::mem::size_of::<f32>();
        assert_eq!(cache.memory_bytes(), expected_bytes);
    }

    #[test]
    fn session_rejects_zero_layers() {
        assert!(matches!(
            SessionKVCache::new(0, 10, 2, 4),
            Err(KVError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn session_estimate_matches_allocation() {
        let session = SessionKVCache::new(3, 16, 2, 4).unwrap();
        assert_eq!(
            SessionKVCache::estimate_bytes(3, 16, 2, 4),
            session.memory_bytes() as u64
        );
    }

    #[test]
    fn session_append_token_atomic_on_capacity_error() {
        let mut session = SessionKVCache::new(2, 1, 2, 4).unwrap();
        let k = [0.1f32; 8];
        let v = [0.2f32; 8];
        session.append_token(&[&k, &k], &[&v, &v]).unwrap();
        assert!(session.append_token(&[&k, &k], &[&v, &v]).is_err());
        for i in 0..2 {
            assert_eq!(session.layer(i).unwrap().seq_len, 1);
        }
    }

    #[test]
    fn stage_then_commit_advances_all_layers() {
        let mut session = SessionKVCache::new(2, 4, 1, 2).unwrap();
        session.stage(0, &[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(session.layer(0).unwrap().seq_len, 1);
        assert_eq!(session.seq_len(), 0);
        session.stage(1, &[2.0, 2.0], &[2.0, 2.0]).unwrap();
        session.commit().unwrap();
        assert_eq!(session.seq_len(), 1);
    }

    #[test]
    fn commit_with_missing_layer_rolls_back() {
        let mut session = SessionKVCache::new(2, 4, 1, 2).unwrap();
        session.stage(0, &[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert!(session.commit().is_err());
        assert_eq!(session.layer(0).unwrap().seq_len, 0);
        assert_eq!(session.layer(1).unwrap().seq_len, 0);
    }

    #[test]
    fn double_stage_is_rejected() {
        let mut session = SessionKVCache::new(1, 4, 1, 2).unwrap();
        session.stage(0, &[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert!(session.stage(0, &[1.0, 1.0], &[1.0, 1.0]).is_err());
    }
}
