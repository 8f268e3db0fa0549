//! Integration tests for scout-kv.
//!
//! Validates:
//! - KV equivalence: prefill and sequential appends leave identical state
//! - Prefix reuse: truncate + re-append equals building from scratch
//! - Staged (layer-by-layer) writes
//! - Capacity management and boundary conditions

use scout_kv::*;

fn token(seed: usize, len: usize) -> Vec<f32> {
    (0..len).map(|i| (seed * len + i) as f32 * 0.1).collect()
}

#[test]
fn kv_equivalence_prefill_vs_sequential_append() {
    let (n_heads, head_dim, seq_len) = (4, 8, 5);
    let stride = n_heads * head_dim;

    let k_data: Vec<f32> = (0..seq_len).flat_map(|t| token(t, stride)).collect();
    let v_data: Vec<f32> = k_data.iter().map(|x| x * 2.0 + 1.0).collect();

    let mut prefilled = LayerKVCache::new(16, n_heads, head_dim);
    prefilled.write_prefill(&k_data, &v_data).unwrap();

    let mut appended = LayerKVCache::new(16, n_heads, head_dim);
    for t in 0..seq_len {
        let range = t * stride..(t + 1) * stride;
        appended
            .append_token(&k_data[range.clone()], &v_data[range])
            .unwrap();
    }

    assert_eq!(prefilled.seq_len, appended.seq_len);
    assert_eq!(prefilled.keys(), appended.keys());
    assert_eq!(prefilled.values(), appended.values());
}

#[test]
fn truncate_then_reappend_matches_fresh_cache() {
    let stride = 2 * 4;
    let mut reused = LayerKVCache::new(8, 2, 4);
    for t in 0..6 {
        reused.append_token(&token(t, stride), &token(t, stride)).unwrap();
    }
    // Keep a 3-token shared prefix, then diverge.
    reused.truncate(3);
    for t in 10..12 {
        reused.append_token(&token(t, stride), &token(t, stride)).unwrap();
    }

    let mut fresh = LayerKVCache::new(8, 2, 4);
    for t in [0, 1, 2, 10, 11] {
        fresh.append_token(&token(t, stride), &token(t, stride)).unwrap();
    }

    assert_eq!(reused.keys(), fresh.keys());
    assert_eq!(reused.values(), fresh.values());
}

#[test]
fn staged_forward_pass_over_three_layers() {
    let mut cache = SessionKVCache::new(3, 4, 1, 2).unwrap();
    for pos in 0..4 {
        for layer in 0..3 {
            let k = [pos as f32, layer as f32];
            cache.stage(layer, &k, &k).unwrap();
            // The layer sees its own new entry before commit.
            assert_eq!(cache.layer(layer).unwrap().key(pos, 0), &k);
        }
        cache.commit().unwrap();
        assert_eq!(cache.seq_len(), pos + 1);
    }

    // Full: the next stage fails and nothing moves.
    let err = cache.stage(0, &[0.0, 0.0], &[0.0, 0.0]).unwrap_err();
    assert_eq!(err, KVError::CapacityExceeded { seq_len: 5, max: 4 });
    assert_eq!(cache.seq_len(), 4);
}

#[test]
fn discard_staged_restores_committed_length() {
    let mut cache = SessionKVCache::new(2, 4, 1, 2).unwrap();
    cache.stage(0, &[1.0, 1.0], &[1.0, 1.0]).unwrap();
    cache.discard_staged();
    assert_eq!(cache.layer(0).unwrap().seq_len, 0);
    // The position can be staged again.
    cache.stage(0, &[2.0, 2.0], &[2.0, 2.0]).unwrap();
    cache.stage(1, &[2.0, 2.0], &[2.0, 2.0]).unwrap();
    cache.commit().unwrap();
    assert_eq!(cache.layer(0).unwrap().key(0, 0), &[2.0, 2.0]);
}

#[test]
fn session_truncate_and_clear() {
    let mut cache = SessionKVCache::new(2, 8, 1, 2).unwrap();
    let k = [0.5f32, 0.5];
    for _ in 0..5 {
        cache.append_token(&[&k, &k], &[&k, &k]).unwrap();
    }
    cache.truncate(2);
    assert_eq!(cache.seq_len(), 2);
    assert_eq!(cache.layer(1).unwrap().seq_len, 2);
    assert_eq!(
        cache.active_memory_bytes(),
        2 * 2 * 2 * 2 * std::mem::size_of::<f32>()
    );

    cache.clear();
    assert_eq!(cache.seq_len(), 0);
    assert_eq!(cache.capacity(), 8);
}

#[test]
fn layer_count_mismatch_is_rejected() {
    let mut cache = SessionKVCache::new(2, 8, 1, 2).unwrap();
    let k = [0.0f32; 2];
    assert_eq!(
        cache.append_token(&[&k], &[&k]),
        Err(KVError::ShapeMismatch { expected: 2, got: 1 })
    );
}

#[test]
fn prefill_exact_capacity_then_overflow() {
    let mut cache = LayerKVCache::new(2, 1, 2);
    cache.write_prefill(&[0.0; 4], &[0.0; 4]).unwrap();
    assert_eq!(cache.seq_len, 2);
    assert!(matches!(
        cache.append_token(&[0.0; 2], &[0.0; 2]),
        Err(KVError::CapacityExceeded { seq_len: 3, max: 2 })
    ));
}
