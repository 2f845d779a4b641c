use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::CodecRegistry;
use crate::config::CompressionConfig;
use crate::envelope::CodecId;

/// Outcome of a successful compression attempt. `data` is the raw compressed
/// byte stream - the caller base64-encodes it for a single envelope body or
/// splits it into chunks, whichever the size dictates.
pub struct CompressionResult {
    pub data: Bytes,
    pub codec: CodecId,
    pub original_size: usize,
    pub compressed_size: usize,
}

impl CompressionResult {
    /// Body form for a single (non-chunked) envelope.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// Decides whether compression applies and performs it. Every reason not to
/// compress collapses into a None from `try_compress` - the caller then sends
/// the payload uncompressed, which is always correct.
pub struct CompressionPipeline {
    config: CompressionConfig,
    registry: CodecRegistry,
}

impl CompressionPipeline {
    pub fn new(config: CompressionConfig) -> CompressionPipeline {
        let registry = CodecRegistry::new(config.level);
        CompressionPipeline { config, registry }
    }

    pub fn should_compress(&self, size: usize) -> bool {
        self.config.enabled && size >= self.config.min_size
    }

    /// Returns None when compression is disabled, the payload is below the
    /// size threshold, the configured codec is unavailable, compression
    /// fails, or the achieved reduction is below `min_reduction_pct`.
    pub fn try_compress(&self, payload: &[u8]) -> Option<CompressionResult> {
        if !self.should_compress(payload.len()) {
            return None;
        }

        let Some(codec) = self.registry.get(self.config.codec) else {
            debug!("configured codec {} is unavailable, sending uncompressed", self.config.codec.name());
            return None;
        };

        let compressed = match codec.compress(payload) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("compression with {} failed, sending uncompressed: {}", codec.name(), e);
                return None;
            }
        };

        let reduction = (1.0 - compressed.len() as f64 / payload.len() as f64) * 100.0;
        if reduction < self.config.min_reduction_pct as f64 {
            debug!(
                "compression saved only {:.1}% on {} bytes, sending uncompressed",
                reduction,
                payload.len()
            );
            return None;
        }

        Some(CompressionResult {
            original_size: payload.len(),
            compressed_size: compressed.len(),
            data: Bytes::from(compressed),
            codec: self.config.codec,
        })
    }

    /// Decompresses a raw compressed byte stream, e.g. a reassembled chunked
    /// payload. None means the message cannot be delivered (unavailable codec
    /// or corrupt data) - the protocol does not retry this.
    pub fn decompress_raw(&self, data: &[u8], codec: CodecId) -> Option<Vec<u8>> {
        let Some(codec) = self.registry.get(codec) else {
            warn!("cannot decompress message: codec {} is unavailable", codec.name());
            return None;
        };

        match codec.decompress(data) {
            Ok(decompressed) => Some(decompressed),
            Err(e) => {
                warn!("decompression with {} failed: {}", codec.name(), e);
                None
            }
        }
    }

    /// Inverse of `try_compress` for a single envelope body: base64 text in,
    /// application value out.
    pub fn try_decompress(&self, data: &str, codec: CodecId) -> Option<Value> {
        let raw = match BASE64.decode(data) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("compressed body is not valid base64: {}", e);
                return None;
            }
        };

        let decompressed = self.decompress_raw(&raw, codec)?;
        match serde_json::from_slice(&decompressed) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("decompressed body is not a valid message: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn config(enabled: bool, codec: CodecId) -> CompressionConfig {
        CompressionConfig {
            enabled,
            codec,
            level: 6,
            min_size: 256,
            min_reduction_pct: 10,
        }
    }

    /// deterministic high-entropy bytes that no codec can shrink
    fn incompressible(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[rstest]
    #[case::gzip(CodecId::Gzip)]
    #[case::zstd(CodecId::Zstd)]
    fn test_compress_decompress_round_trip(#[case] codec: CodecId) {
        let pipeline = CompressionPipeline::new(config(true, codec));
        let value = json!({"payload": "x".repeat(1000)});
        let serialized = serde_json::to_vec(&value).unwrap();

        let result = pipeline.try_compress(&serialized).unwrap();
        assert_eq!(result.codec, codec);
        assert_eq!(result.original_size, serialized.len());
        assert!(result.compressed_size < result.original_size);

        let decoded = pipeline.try_decompress(&result.to_base64(), codec).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_disabled_pipeline_never_compresses() {
        let pipeline = CompressionPipeline::new(config(false, CodecId::Gzip));
        assert!(!pipeline.should_compress(100_000));
        assert!(pipeline.try_compress(&vec![b'x'; 100_000]).is_none());
    }

    #[rstest]
    #[case::below_threshold(255, false)]
    #[case::at_threshold(256, true)]
    #[case::above_threshold(10_000, true)]
    fn test_min_size_gate(#[case] size: usize, #[case] compressed: bool) {
        let pipeline = CompressionPipeline::new(config(true, CodecId::Gzip));
        assert_eq!(pipeline.should_compress(size), compressed);
        assert_eq!(pipeline.try_compress(&vec![b'x'; size]).is_some(), compressed);
    }

    #[test]
    fn test_insufficient_reduction_skips_compression() {
        let pipeline = CompressionPipeline::new(config(true, CodecId::Gzip));
        assert!(pipeline.try_compress(&incompressible(2000)).is_none());
    }

    #[rstest]
    #[case::none(CodecId::None)]
    #[case::snappy(CodecId::Snappy)]
    #[case::lz4(CodecId::Lz4)]
    fn test_unavailable_codec_skips_compression(#[case] codec: CodecId) {
        let pipeline = CompressionPipeline::new(config(true, codec));
        assert!(pipeline.try_compress(&vec![b'x'; 1000]).is_none());
    }

    #[test]
    fn test_decompress_with_unavailable_codec_fails() {
        let pipeline = CompressionPipeline::new(config(true, CodecId::Gzip));
        let result = pipeline.try_compress(&serde_json::to_vec(&json!("y".repeat(500))).unwrap()).unwrap();
        assert!(pipeline.try_decompress(&result.to_base64(), CodecId::Snappy).is_none());
    }

    #[rstest]
    #[case::not_base64("!!! not base64 !!!")]
    #[case::not_gzip("aGVsbG8gd29ybGQ=")]
    fn test_try_decompress_rejects_garbage(#[case] data: &str) {
        let pipeline = CompressionPipeline::new(config(true, CodecId::Gzip));
        assert!(pipeline.try_decompress(data, CodecId::Gzip).is_none());
    }

    #[test]
    fn test_utf8_payload_survives_compression() {
        let pipeline = CompressionPipeline::new(config(true, CodecId::Gzip));
        let value = json!({"message": "Hello 世界 🌍 مرحبا ".repeat(50)});
        let serialized = serde_json::to_vec(&value).unwrap();

        let result = pipeline.try_compress(&serialized).unwrap();
        assert_eq!(pipeline.try_decompress(&result.to_base64(), CodecId::Gzip).unwrap(), value);
    }
}
