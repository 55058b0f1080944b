// ── Pattern compression ────────────────────────────────────────────────────
//
// Tiered storage for consolidated pattern centroids:
//
// | Level  | Bytes/dim | Payload                                     |
// |--------|-----------|---------------------------------------------|
// | Full   | 4         | f32 little-endian                           |
// | Half   | 2         | upper 16 bits of each f32 (bf16 truncation) |
// | Int8   | 1         | f32 min, f32 scale, then one u8 per dim     |
// | Binary | 1/8       | sign bits, LSB first                        |
//
// `decompress` restores an approximate vector; only `Full` is lossless.
// Readers go through `load_centroid`, which serves a compressed row when one
// exists and the full-precision centroid otherwise.

use crate::atoms::constants::{COMPRESSED_PATTERNS, NEURAL_PATTERNS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CompressedPattern, CompressionLevel, NeuralPattern};
use crate::engine::store::{f32_vec_to_bytes, RecordStore, Session};
use log::info;
use serde_json::Value;

pub fn compress(vector: &[f32], level: CompressionLevel) -> Vec<u8> {
    match level {
        CompressionLevel::Full => f32_vec_to_bytes(vector),
        CompressionLevel::Half => vector
            .iter()
            .flat_map(|f| ((f.to_bits() >> 16) as u16).to_le_bytes())
            .collect(),
        CompressionLevel::Int8 => {
            let min = vector.iter().copied().fold(f32::INFINITY, f32::min);
            let max = vector.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let (min, scale) = if vector.is_empty() {
                (0.0, 1.0)
            } else if (max - min).abs() < f32::EPSILON {
                (min, 1.0)
            } else {
                (min, (max - min) / 255.0)
            };
            let mut out = Vec::with_capacity(8 + vector.len());
            out.extend_from_slice(&min.to_le_bytes());
            out.extend_from_slice(&scale.to_le_bytes());
            out.extend(
                vector.iter().map(|&v| ((v - min) / scale).round().clamp(0.0, 255.0) as u8),
            );
            out
        }
        CompressionLevel::Binary => {
            let mut out = vec![0u8; vector.len().div_ceil(8)];
            for (i, &v) in vector.iter().enumerate() {
                if v > 0.0 {
                    out[i / 8] |= 1 << (i % 8);
                }
            }
            out
        }
    }
}

/// Restore an approximate vector of `pattern.dims` values.
pub fn decompress(pattern: &CompressedPattern) -> EngineResult<Vec<f32>> {
    let dims = usize::try_from(pattern.dims).map_err(|_| bad(pattern, "negative dims"))?;
    let payload = &pattern.payload;
    let expected_len = match pattern.compression_level {
        CompressionLevel::Full => dims * 4,
        CompressionLevel::Half => dims * 2,
        CompressionLevel::Int8 => 8 + dims,
        CompressionLevel::Binary => dims.div_ceil(8),
    };
    if payload.len() != expected_len {
        return Err(bad(
            pattern,
            &format!("payload is {} bytes, expected {}", payload.len(), expected_len),
        ));
    }

    let out = match pattern.compression_level {
        CompressionLevel::Full => payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        CompressionLevel::Half => payload
            .chunks_exact(2)
            .map(|c| f32::from_bits((u16::from_le_bytes([c[0], c[1]]) as u32) << 16))
            .collect(),
        CompressionLevel::Int8 => {
            let min = f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let scale = f32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
            payload[8..].iter().map(|&q| min + q as f32 * scale).collect()
        }
        CompressionLevel::Binary => (0..dims)
            .map(|i| if payload[i / 8] & (1 << (i % 8)) != 0 { 1.0 } else { -1.0 })
            .collect(),
    };
    Ok(out)
}

fn bad(pattern: &CompressedPattern, msg: &str) -> EngineError {
    EngineError::invalid_record(COMPRESSED_PATTERNS, format!("{}: {}", pattern.id, msg))
}

/// A neural pattern centroid as served to readers.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    pub vector: Vec<f32>,
    /// `None` when read from the full-precision `neural_patterns` row.
    pub level: Option<CompressionLevel>,
}

const LEVELS: [CompressionLevel; 4] = [
    CompressionLevel::Full,
    CompressionLevel::Half,
    CompressionLevel::Int8,
    CompressionLevel::Binary,
];

/// Centroid of neural pattern `id`. The most precise compressed row wins;
/// without one, the `neural_patterns` row is read.
pub fn load_centroid(store: &RecordStore, id: &str) -> EngineResult<Option<Centroid>> {
    for level in LEVELS {
        let key = format!("{}:{}", id, level.as_str());
        if let Some(row) = store.get(COMPRESSED_PATTERNS, &key)? {
            let packed: CompressedPattern = serde_json::from_value(Value::Object(row))?;
            return Ok(Some(Centroid { vector: decompress(&packed)?, level: Some(level) }));
        }
    }
    match store.get(NEURAL_PATTERNS, id)? {
        Some(row) => {
            let pattern: NeuralPattern = serde_json::from_value(Value::Object(row))?;
            Ok(Some(Centroid { vector: pattern.centroid, level: None }))
        }
        None => Ok(None),
    }
}

/// Write one compressed row per neural pattern, keyed `<pattern id>:<level>`.
/// Returns how many were written.
pub fn compress_neural_patterns(
    session: &mut Session<'_>,
    level: CompressionLevel,
) -> EngineResult<usize> {
    let mut written = 0;
    let store = session.store();
    for row in store.query(NEURAL_PATTERNS, |_| true)? {
        let pattern: NeuralPattern = serde_json::from_value(Value::Object(row?))?;
        let compressed = CompressedPattern {
            id: format!("{}:{}", pattern.id, level.as_str()),
            compression_level: level,
            payload: compress(&pattern.centroid, level),
            source_id: Some(pattern.id.clone()),
            dims: pattern.centroid.len() as i64,
        };
        session.put_record(&compressed)?;
        written += 1;
    }
    info!("[store] Compressed {} neural pattern(s) at {:?}", written, level);
    Ok(written)
}
