use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::bail;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustc_hash::FxHashMap;

use crate::envelope::CodecId;

/// A pluggable compression codec. Implementations are probed via
/// `is_available` once at registry construction; the tags of codecs this
/// build does not ship stay valid on the wire but resolve to nothing locally.
pub trait CompressionCodec: Send + Sync + 'static {
    fn id(&self) -> CodecId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    fn is_available(&self) -> bool;

    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub struct GzipCodec {
    level: Compression,
}

impl GzipCodec {
    pub fn new(level: u32) -> GzipCodec {
        GzipCodec {
            level: Compression::new(level.min(9)),
        }
    }
}

impl CompressionCodec for GzipCodec {
    fn id(&self) -> CodecId {
        CodecId::Gzip
    }

    fn is_available(&self) -> bool {
        true
    }

    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: u32) -> ZstdCodec {
        ZstdCodec {
            level: (level.clamp(1, 21)) as i32,
        }
    }
}

impl CompressionCodec for ZstdCodec {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn is_available(&self) -> bool {
        true
    }

    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::encode_all(data, self.level)?)
    }

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::decode_all(data)?)
    }
}

/// Wire tag reserved, codec not shipped in this build.
pub struct SnappyCodec;

impl CompressionCodec for SnappyCodec {
    fn id(&self) -> CodecId {
        CodecId::Snappy
    }

    fn is_available(&self) -> bool {
        false
    }

    fn compress(&self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("snappy codec is not available in this build");
    }

    fn decompress(&self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("snappy codec is not available in this build");
    }
}

/// Wire tag reserved, codec not shipped in this build.
pub struct Lz4Codec;

impl CompressionCodec for Lz4Codec {
    fn id(&self) -> CodecId {
        CodecId::Lz4
    }

    fn is_available(&self) -> bool {
        false
    }

    fn compress(&self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("lz4 codec is not available in this build");
    }

    fn decompress(&self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("lz4 codec is not available in this build");
    }
}

/// Holds the codecs that probed as available. Lookups for anything else
/// return None and the caller decides whether that is a skip (compressing) or
/// a delivery failure (decompressing).
pub struct CodecRegistry {
    codecs: FxHashMap<CodecId, Arc<dyn CompressionCodec>>,
}

impl CodecRegistry {
    pub fn new(level: u32) -> CodecRegistry {
        let candidates: [Arc<dyn CompressionCodec>; 4] = [
            Arc::new(GzipCodec::new(level)),
            Arc::new(SnappyCodec),
            Arc::new(Lz4Codec),
            Arc::new(ZstdCodec::new(level)),
        ];

        CodecRegistry {
            codecs: candidates
                .into_iter()
                .filter(|codec| codec.is_available())
                .map(|codec| (codec.id(), codec))
                .collect(),
        }
    }

    pub fn get(&self, id: CodecId) -> Option<Arc<dyn CompressionCodec>> {
        self.codecs.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::gzip(CodecId::Gzip)]
    #[case::zstd(CodecId::Zstd)]
    fn test_compress_decompress_round_trip(#[case] id: CodecId) {
        let registry = CodecRegistry::new(6);
        let codec = registry.get(id).unwrap();

        let original = b"Hello 1234567890 Hello 1234567890 Hello 1234567890";
        let compressed = codec.compress(original).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[rstest]
    #[case::gzip(CodecId::Gzip)]
    #[case::zstd(CodecId::Zstd)]
    fn test_redundant_data_shrinks(#[case] id: CodecId) {
        let registry = CodecRegistry::new(6);
        let codec = registry.get(id).unwrap();

        let original = vec![b'x'; 1000];
        let compressed = codec.compress(&original).unwrap();
        assert!(compressed.len() < original.len() / 2);
    }

    #[rstest]
    #[case::gzip(CodecId::Gzip, true)]
    #[case::zstd(CodecId::Zstd, true)]
    #[case::snappy(CodecId::Snappy, false)]
    #[case::lz4(CodecId::Lz4, false)]
    #[case::none(CodecId::None, false)]
    fn test_registry_holds_only_available_codecs(#[case] id: CodecId, #[case] available: bool) {
        let registry = CodecRegistry::new(6);
        assert_eq!(registry.get(id).is_some(), available);
    }

    #[test]
    fn test_unavailable_codec_refuses_to_compress() {
        assert!(SnappyCodec.compress(b"data").is_err());
        assert!(Lz4Codec.decompress(b"data").is_err());
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let registry = CodecRegistry::new(6);
        for id in [CodecId::Gzip, CodecId::Zstd] {
            let codec = registry.get(id).unwrap();
            assert!(codec.decompress(b"definitely not compressed").is_err());
        }
    }
}
