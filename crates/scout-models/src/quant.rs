//! ggml tensor types and block (de)quantization.
//!
//! Block layouts (little-endian):
//! - `Q8_0`: f16 scale `d`, 32 × i8 `q`; `x = d * q`
//! - `Q4_0`: f16 scale `d`, 16 bytes of nibbles; element `j` is the low
//!   nibble of byte `j`, element `j + 16` the high nibble; `x = d * (q - 8)`
//! - `Q4_1`: f16 scale `d`, f16 minimum `m`, 16 bytes of nibbles; `x = d * q + m`

use std::fmt;

use half::f16;
use scout_engine::{LoadError, QuantizationTag};

pub const QK: usize = 32;

/// Tensor element type ids as stored in GGUF tensor infos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
    BF16,
    Other(u32),
}

impl GgmlType {
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            3 => GgmlType::Q4_1,
            6 => GgmlType::Q5_0,
            7 => GgmlType::Q5_1,
            8 => GgmlType::Q8_0,
            9 => GgmlType::Q8_1,
            10 => GgmlType::Q2K,
            11 => GgmlType::Q3K,
            12 => GgmlType::Q4K,
            13 => GgmlType::Q5K,
            14 => GgmlType::Q6K,
            15 => GgmlType::Q8K,
            30 => GgmlType::BF16,
            other => GgmlType::Other(other),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            GgmlType::F32 => 0,
            GgmlType::F16 => 1,
            GgmlType::Q4_0 => 2,
            GgmlType::Q4_1 => 3,
            GgmlType::Q5_0 => 6,
            GgmlType::Q5_1 => 7,
            GgmlType::Q8_0 => 8,
            GgmlType::Q8_1 => 9,
            GgmlType::Q2K => 10,
            GgmlType::Q3K => 11,
            GgmlType::Q4K => 12,
            GgmlType::Q5K => 13,
            GgmlType::Q6K => 14,
            GgmlType::Q8K => 15,
            GgmlType::BF16 => 30,
            GgmlType::Other(id) => *id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            GgmlType::F32 => "F32".into(),
            GgmlType::F16 => "F16".into(),
            GgmlType::Q4_0 => "Q4_0".into(),
            GgmlType::Q4_1 => "Q4_1".into(),
            GgmlType::Q5_0 => "Q5_0".into(),
            GgmlType::Q5_1 => "Q5_1".into(),
            GgmlType::Q8_0 => "Q8_0".into(),
            GgmlType::Q8_1 => "Q8_1".into(),
            GgmlType::Q2K => "Q2_K".into(),
            GgmlType::Q3K => "Q3_K".into(),
            GgmlType::Q4K => "Q4_K".into(),
            GgmlType::Q5K => "Q5_K".into(),
            GgmlType::Q6K => "Q6_K".into(),
            GgmlType::Q8K => "Q8_K".into(),
            GgmlType::BF16 => "BF16".into(),
            GgmlType::Other(id) => format!("type#{id}"),
        }
    }

    /// `(elements per block, bytes per block)`, if the layout is known.
    pub fn block_layout(&self) -> Option<(usize, usize)> {
        match self {
            GgmlType::F32 => Some((1, 4)),
            GgmlType::F16 | GgmlType::BF16 => Some((1, 2)),
            GgmlType::Q4_0 => Some((QK, 18)),
            GgmlType::Q4_1 => Some((QK, 20)),
            GgmlType::Q5_0 => Some((QK, 22)),
            GgmlType::Q5_1 => Some((QK, 24)),
            GgmlType::Q8_0 => Some((QK, 34)),
            GgmlType::Q8_1 => Some((QK, 36)),
            GgmlType::Q2K => Some((256, 84)),
            GgmlType::Q3K => Some((256, 110)),
            GgmlType::Q4K => Some((256, 144)),
            GgmlType::Q5K => Some((256, 176)),
            GgmlType::Q6K => Some((256, 210)),
            GgmlType::Q8K => Some((256, 292)),
            GgmlType::Other(_) => None,
        }
    }

    /// Bytes needed for `n_elements`, if the layout is known and `n_elements`
    /// fills whole blocks.
    pub fn data_size(&self, n_elements: u64) -> Option<u64> {
        let (block, bytes) = self.block_layout()?;
        let block = block as u64;
        if n_elements % block != 0 {
            return None;
        }
        (n_elements / block).checked_mul(bytes as u64)
    }

    /// The quantization tag this type computes as, if the runtime supports it.
    pub fn quantization_tag(&self) -> Option<QuantizationTag> {
        match self {
            GgmlType::F32 => Some(QuantizationTag::F32),
            GgmlType::F16 => Some(QuantizationTag::F16),
            GgmlType::Q8_0 => Some(QuantizationTag::Q8_0),
            GgmlType::Q4_0 => Some(QuantizationTag::Q4_0),
            GgmlType::Q4_1 => Some(QuantizationTag::Q4_1),
            _ => None,
        }
    }

    pub fn from_tag(tag: QuantizationTag) -> Self {
        match tag {
            QuantizationTag::F32 => GgmlType::F32,
            QuantizationTag::F16 => GgmlType::F16,
            QuantizationTag::Q8_0 => GgmlType::Q8_0,
            QuantizationTag::Q4_0 => GgmlType::Q4_0,
            QuantizationTag::Q4_1 => GgmlType::Q4_1,
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn read_f16(bytes: &[u8], at: usize) -> f32 {
    f16::from_bits(u16::from_le_bytes([bytes[at], bytes[at + 1]])).to_f32()
}

/// Expand `n_elements` values of type `ty` to f32.
pub fn dequantize(ty: GgmlType, data: &[u8], n_elements: usize) -> Result<Vec<f32>, LoadError> {
    let tag = ty
        .quantization_tag()
        .ok_or_else(|| LoadError::UnsupportedQuantization(ty.name()))?;
    let expected = ty.data_size(n_elements as u64).ok_or_else(|| {
        LoadError::Malformed(format!(
            "{n_elements} elements do not fill whole {ty} blocks"
        ))
    })? as usize;
    if data.len() < expected {
        return Err(LoadError::Malformed(format!(
            "{ty} tensor needs {expected} bytes, found {}",
            data.len()
        )));
    }
    let data = &data[..expected];

    let mut out = Vec::with_capacity(n_elements);
    match tag {
        QuantizationTag::F32 => {
            out.extend(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        QuantizationTag::F16 => {
            out.extend(data.chunks_exact(2).map(|c| read_f16(c, 0)));
        }
        QuantizationTag::Q8_0 => {
            for block in data.chunks_exact(34) {
                let d = read_f16(block, 0);
                out.extend(block[2..].iter().map(|&q| d * (q as i8) as f32));
            }
        }
        QuantizationTag::Q4_0 => {
            for block in data.chunks_exact(18) {
                let d = read_f16(block, 0);
                let qs = &block[2..];
                out.extend(qs.iter().map(|&b| d * ((b & 0x0F) as i32 - 8) as f32));
                out.extend(qs.iter().map(|&b| d * ((b >> 4) as i32 - 8) as f32));
            }
        }
        QuantizationTag::Q4_1 => {
            for block in data.chunks_exact(20) {
                let d = read_f16(block, 0);
                let m = read_f16(block, 2);
                let qs = &block[4..];
                out.extend(qs.iter().map(|&b| d * (b & 0x0F) as f32 + m));
                out.extend(qs.iter().map(|&b| d * (b >> 4) as f32 + m));
            }
        }
    }
    Ok(out)
}

/// Encode f32 values as `ty`. `values.len()` must fill whole blocks.
pub fn quantize(ty: GgmlType, values: &[f32]) -> Result<Vec<u8>, LoadError> {
    let tag = ty
        .quantization_tag()
        .ok_or_else(|| LoadError::UnsupportedQuantization(ty.name()))?;
    let size = ty.data_size(values.len() as u64).ok_or_else(|| {
        LoadError::Malformed(format!(
            "{} elements do not fill whole {ty} blocks",
            values.len()
        ))
    })? as usize;

    let mut out = Vec::with_capacity(size);
    match tag {
        QuantizationTag::F32 => {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        QuantizationTag::F16 => {
            for v in values {
                out.extend_from_slice(&f16::from_f32(*v).to_bits().to_le_bytes());
            }
        }
        QuantizationTag::Q8_0 => {
            for block in values.chunks_exact(QK) {
                let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
                let d = amax / 127.0;
                let id = if d > 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_bits().to_le_bytes());
                out.extend(block.iter().map(|v| (v * id).round().clamp(-128.0, 127.0) as i8 as u8));
            }
        }
        QuantizationTag::Q4_0 => {
            for block in values.chunks_exact(QK) {
                // Signed max-magnitude value maps to -8.
                let max = block
                    .iter()
                    .fold(0.0f32, |m, &v| if v.abs() > m.abs() { v } else { m });
                let d = max / -8.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_bits().to_le_bytes());
                let q = |v: f32| ((v * id + 8.5) as i32).clamp(0, 15) as u8;
                for j in 0..QK / 2 {
                    out.push(q(block[j]) | (q(block[j + QK / 2]) << 4));
                }
            }
        }
        QuantizationTag::Q4_1 => {
            for block in values.chunks_exact(QK) {
                let min = block.iter().cloned().fold(f32::INFINITY, f32::min);
                let max = block.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let d = (max - min) / 15.0;
                let id = if d > 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_bits().to_le_bytes());
                out.extend_from_slice(&f16::from_f32(min).to_bits().to_le_bytes());
                let q = |v: f32| (((v - min) * id + 0.5) as i32).clamp(0, 15) as u8;
                for j in 0..QK / 2 {
                    out.push(q(block[j]) | (q(block[j + QK / 2]) << 4));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f32> {
        (0..64).map(|i| (i as f32 - 31.5) / 16.0).collect()
    }

    fn max_err(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn type_ids_roundtrip() {
        for id in [0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 30, 99] {
            assert_eq!(GgmlType::from_id(id).id(), id);
        }
        assert_eq!(GgmlType::from_id(12).name(), "Q4_K");
    }

    #[test]
    fn data_sizes() {
        assert_eq!(GgmlType::F32.data_size(10), Some(40));
        assert_eq!(GgmlType::Q8_0.data_size(64), Some(68));
        assert_eq!(GgmlType::Q4_0.data_size(32), Some(18));
        assert_eq!(GgmlType::Q4_0.data_size(33), None);
        assert_eq!(GgmlType::Other(77).data_size(32), None);
    }

    #[test]
    fn only_five_types_are_supported() {
        assert!(GgmlType::Q4K.quantization_tag().is_none());
        assert!(matches!(
            dequantize(GgmlType::Q6K, &[0; 210], 256),
            Err(LoadError::UnsupportedQuantization(name)) if name == "Q6_K"
        ));
    }

    #[test]
    fn f32_and_f16_are_near_lossless() {
        let x = ramp();
        let f32_back = dequantize(GgmlType::F32, &quantize(GgmlType::F32, &x).unwrap(), 64).unwrap();
        assert_eq!(f32_back, x);
        let f16_back = dequantize(GgmlType::F16, &quantize(GgmlType::F16, &x).unwrap(), 64).unwrap();
        assert!(max_err(&x, &f16_back) < 1e-3);
    }

    #[test]
    fn q8_0_error_is_bounded_by_scale() {
        let x = ramp();
        let back = dequantize(GgmlType::Q8_0, &quantize(GgmlType::Q8_0, &x).unwrap(), 64).unwrap();
        assert!(max_err(&x, &back) < 2.0 / 127.0);
    }

    #[test]
    fn q4_variants_stay_within_one_step() {
        let x = ramp();
        for ty in [GgmlType::Q4_0, GgmlType::Q4_1] {
            let bytes = quantize(ty, &x).unwrap();
            assert_eq!(bytes.len() as u64, ty.data_size(64).unwrap());
            let back = dequantize(ty, &bytes, 64).unwrap();
            // One quantization step of a block spanning ~2.0
            assert!(max_err(&x, &back) < 0.3, "{ty} error too large");
        }
    }

    #[test]
    fn q4_0_nibble_order() {
        // d = 1.0, low nibbles 9 (→ +1), high nibbles 7 (→ -1)
        let mut block = f16::from_f32(1.0).to_bits().to_le_bytes().to_vec();
        block.extend(std::iter::repeat(0x79).take(16));
        let values = dequantize(GgmlType::Q4_0, &block, 32).unwrap();
        assert!(values[..16].iter().all(|&v| v == 1.0));
        assert!(values[16..].iter().all(|&v| v == -1.0));
    }

    #[test]
    fn short_data_is_malformed() {
        assert!(matches!(
            dequantize(GgmlType::Q8_0, &[0; 10], 32),
            Err(LoadError::Malformed(_))
        ));
    }
}
