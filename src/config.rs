use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::envelope::CodecId;

/// Configuration of a reliable socket. All tunables of the protocol live here;
/// there is no hidden state in environment variables or config files.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// The local address the receive socket binds to.
    pub self_addr: SocketAddr,

    /// Worker id that goes into every generated message id. Deployments with
    /// several nodes should assign distinct worker ids so ids never collide
    /// across senders. Must be in `0..=1023`.
    pub worker_id: u16,

    /// Payload size threshold above which a message is split into chunks.
    ///
    /// This is deliberately *not* derived from the MTU: optional IP headers and
    /// surprising network hardware make MTU discovery unreliable, so the
    /// application carries the responsibility of choosing a size that fits a
    /// single datagram on all routes between its nodes. Must lie in
    /// `[100, 65000]`.
    pub max_message_size: usize,

    /// Size of each chunk of an oversized message, in bytes of the raw payload
    /// before base64 encoding.
    pub chunk_size: usize,

    /// Upper bound on retransmissions per request envelope. The retry counter
    /// caps wire traffic; the request timeout is the final deadline.
    pub max_retries: u32,

    /// Delay between retransmissions of an unacknowledged envelope.
    pub retry_interval: Duration,

    /// Deadline for an outstanding request to resolve. When it expires the
    /// request fails regardless of how many retries are left.
    pub request_timeout: Duration,

    /// How long a partially reassembled message is kept before it is
    /// discarded. No negative acknowledgement is sent; the sender's own
    /// timeout covers the loss.
    pub reassembly_timeout: Duration,

    /// Whether outgoing envelopes carry a SHA-256 checksum over their body and
    /// incoming checksums are verified.
    pub enable_checksum: bool,

    pub compression: CompressionConfig,
}

/// Compression tunables. Compression is off by default - it only pays for
/// itself on payloads that are both large and redundant, and the thresholds
/// below keep it from being applied blindly.
#[derive(Clone, Debug)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// Which codec to compress outgoing bodies with. Incoming bodies are
    /// decompressed with whatever codec their flags name, independent of this
    /// setting.
    pub codec: CodecId,

    /// Codec-specific compression level.
    pub level: u32,

    /// Bodies smaller than this are never compressed.
    pub min_size: usize,

    /// Minimum size reduction, in percent, for a compression result to be
    /// used. Below this the uncompressed body is sent.
    pub min_reduction_pct: u8,
}

impl SocketConfig {
    pub fn new(self_addr: SocketAddr) -> SocketConfig {
        SocketConfig {
            self_addr,
            worker_id: 0,
            max_message_size: 1400,
            chunk_size: 1200,
            max_retries: 5,
            retry_interval: Duration::from_millis(500),
            request_timeout: Duration::from_millis(5000),
            reassembly_timeout: Duration::from_millis(30000),
            enable_checksum: true,
            compression: CompressionConfig {
                enabled: false,
                codec: CodecId::None,
                level: 6,
                min_size: 256,
                min_reduction_pct: 10,
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size < 100 || self.max_message_size > 65000 {
            bail!(
                "max_message_size {} outside the supported range [100, 65000]",
                self.max_message_size
            );
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be positive");
        }
        if self.worker_id > 1023 {
            bail!("worker_id {} out of range 0..=1023", self.worker_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> SocketConfig {
        SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        config.validate().unwrap();

        assert_eq!(config.max_message_size, 1400);
        assert_eq!(config.chunk_size, 1200);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert_eq!(config.reassembly_timeout, Duration::from_millis(30000));
        assert!(config.enable_checksum);
        assert!(!config.compression.enabled);
        assert_eq!(config.compression.codec, CodecId::None);
        assert_eq!(config.compression.min_size, 256);
        assert_eq!(config.compression.min_reduction_pct, 10);
    }

    #[rstest]
    #[case::lower_bound(100, true)]
    #[case::below_lower_bound(99, false)]
    #[case::upper_bound(65000, true)]
    #[case::above_upper_bound(65001, false)]
    #[case::zero(0, false)]
    fn test_validate_max_message_size(#[case] size: usize, #[case] valid: bool) {
        let mut config = config();
        config.max_message_size = size;
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = config();
        config.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_worker_id() {
        let mut config = config();
        config.worker_id = 1024;
        assert!(config.validate().is_err());
    }
}
