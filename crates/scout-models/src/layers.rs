//! Transformer building blocks for the llama architecture.
//!
//! All tensors are dequantized `f32`, row-major.

/// A dense `[rows][cols]` weight matrix.
#[derive(Debug, Clone)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// `y = W · x`, with `x.len() == cols`.
    pub fn matvec(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.cols);
        self.data
            .chunks_exact(self.cols)
            .map(|row| dot(row, x))
            .collect()
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / RMS(x) * weight`, where RMS(x) = sqrt(mean(x^2) + eps)
///
/// # References
/// - Zhang & Sennrich (2019): "Root Mean Square Layer Normalization"
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale, shape: [d_model]
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RmsNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let scale = 1.0 / (mean_sq + self.eps).sqrt();
        x.iter()
            .zip(&self.weight)
            .map(|(v, w)| v * scale * w)
            .collect()
    }
}

/// Rotary Position Embeddings (RoPE).
///
/// Rotates each interleaved pair `(x[2i], x[2i+1])` of every head by the
/// angle `pos / base^(2i/head_dim)`.
///
/// # References
/// - Su et al. (2021): "RoFormer: Enhanced Transformer with Rotary Position Embedding"
#[derive(Debug, Clone)]
pub struct Rope {
    pub head_dim: usize,
    /// `1 / base^(2i/head_dim)` for i in 0..head_dim/2
    pub inv_freq: Vec<f32>,
}

impl Rope {
    pub fn new(head_dim: usize, base: f32) -> Self {
        let inv_freq = (0..head_dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        Self { head_dim, inv_freq }
    }

    /// Rotate `x` (`n_heads × head_dim`, flattened) in place for position `pos`.
    pub fn apply(&self, x: &mut [f32], pos: usize) {
        for head in x.chunks_exact_mut(self.head_dim) {
            for (i, &freq) in self.inv_freq.iter().enumerate() {
                let (sin, cos) = (pos as f32 * freq).sin_cos();
                let a = head[2 * i];
                let b = head[2 * i + 1];
                head[2 * i] = a * cos - b * sin;
                head[2 * i + 1] = a * sin + b * cos;
            }
        }
    }
}

pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// SwiGLU feed-forward: `down · (silu(gate · x) ⊙ (up · x))`.
pub fn swiglu(gate: &Matrix, up: &Matrix, down: &Matrix, x: &[f32]) -> Vec<f32> {
    let g = gate.matvec(x);
    let u = up.matvec(x);
    let hidden: Vec<f32> = g.iter().zip(&u).map(|(g, u)| silu(*g) * u).collect();
    down.matvec(&hidden)
}

/// Scaled dot-product attention for one query position with grouped-query
/// heads: query head `h` reads key/value head `h / (n_heads / n_kv_heads)`.
///
/// `key(t, kv_head)` and `value(t, kv_head)` return cached rows for positions
/// `0..n_positions`.
pub fn attention<'a, K, V>(
    q: &[f32],
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    n_positions: usize,
    key: K,
    value: V,
) -> Vec<f32>
where
    K: Fn(usize, usize) -> &'a [f32],
    V: Fn(usize, usize) -> &'a [f32],
{
    let group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0; n_heads * head_dim];
    let mut scores = vec![0.0; n_positions];

    for h in 0..n_heads {
        let kv = h / group;
        let q_h = &q[h * head_dim..(h + 1) * head_dim];
        for (t, s) in scores.iter_mut().enumerate() {
            *s = dot(q_h, key(t, kv)) * scale;
        }
        softmax_in_place(&mut scores);
        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &w) in scores.iter().enumerate() {
            for (o, v) in out_h.iter_mut().zip(value(t, kv)) {
                *o += w * v;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_is_scale_invariant() {
        let norm = RmsNorm::new(vec![1.0; 4], 1e-6);
        let a = norm.forward(&[1.0, 2.0, 3.0, 4.0]);
        let b = norm.forward(&[2.0, 4.0, 6.0, 8.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
        let rms = (a.iter().map(|v| v * v).sum::<f32>() / 4.0).sqrt();
        assert!((rms - 1.0).abs() < 1e-4);
    }

    #[test]
    fn rope_position_zero_is_identity() {
        let rope = Rope::new(4, 10000.0);
        let mut x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let orig = x.clone();
        rope.apply(&mut x, 0);
        assert_eq!(x, orig);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let rope = Rope::new(4, 10000.0);
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        rope.apply(&mut x, 7);
        let n0 = (x[0] * x[0] + x[1] * x[1]).sqrt();
        assert!((n0 - 5f32.sqrt()).abs() < 1e-5);
        let n1 = (x[2] * x[2] + x[3] * x[3]).sqrt();
        assert!((n1 - 5.0).abs() < 1e-5);
    }

    #[test]
    fn matvec_uses_rows_as_outputs() {
        let w = Matrix::new(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(w.matvec(&[2.0, 3.0, 4.0]), vec![2.0, 7.0]);
        assert_eq!(w.row(1), &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut x = vec![1.0, 2.0, 3.0, 1000.0];
        softmax_in_place(&mut x);
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(x[3] > 0.99);
    }

    #[test]
    fn single_position_attention_returns_value() {
        // Two query heads share one KV head.
        let keys = vec![0.5, -0.5];
        let values = vec![3.0, 4.0];
        let out = attention(
            &[1.0, 0.0, 0.0, 1.0],
            2,
            1,
            2,
            1,
            |_, _| keys.as_slice(),
            |_, _| values.as_slice(),
        );
        assert_eq!(out, vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn silu_matches_definition() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
    }
}
