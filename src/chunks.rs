use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::envelope::CodecId;

/// Splits a payload into `ceil(len / chunk_size)` base64-encoded pieces, in
/// chunk-index order.
pub fn create_chunks(data: &[u8], chunk_size: usize) -> Vec<String> {
    data.chunks(chunk_size)
        .map(|chunk| BASE64.encode(chunk))
        .collect()
}

struct Assembly {
    /// slot per chunk index, append-once - duplicates are dropped
    chunks: Vec<Option<String>>,
    received_count: u32,
    created_at: Instant,
    remote: SocketAddr,
    /// recorded from the first chunk that arrives, whatever its index -
    /// every chunk of a logical message carries the same codec bits
    codec: CodecId,
}

impl Assembly {
    fn total(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.total() && self.chunks.iter().all(|slot| slot.is_some())
    }
}

/// Collects chunks of logical messages, keyed by base id. Chunks may arrive
/// in any order and arbitrarily duplicated; each logical message becomes
/// available for delivery exactly once.
pub struct Reassembler {
    assemblies: FxHashMap<String, Assembly>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler {
            assemblies: FxHashMap::default(),
        }
    }

    pub fn has_assembly(&self, base_id: &str) -> bool {
        self.assemblies.contains_key(base_id)
    }

    pub fn init_assembly(&mut self, base_id: &str, total: u32, remote: SocketAddr, codec: CodecId) {
        if self.assemblies.contains_key(base_id) {
            return;
        }
        debug!("starting reassembly of {} ({} chunks) from {:?}", base_id, total, remote);
        self.assemblies.insert(
            base_id.to_string(),
            Assembly {
                chunks: vec![None; total as usize],
                received_count: 0,
                created_at: Instant::now(),
                remote,
                codec,
            },
        );
    }

    /// Stores one chunk. Returns true iff the assembly is complete after this
    /// call. Duplicates and out-of-range indices are dropped, so calling this
    /// again with the same `(base_id, index)` has no further effect.
    pub fn add_chunk(&mut self, base_id: &str, index: u32, data: String) -> bool {
        let Some(assembly) = self.assemblies.get_mut(base_id) else {
            warn!("chunk {} of unknown assembly {} - dropping", index, base_id);
            return false;
        };

        if index >= assembly.total() {
            warn!(
                "chunk index {} out of range for assembly {} with {} chunks - dropping",
                index,
                base_id,
                assembly.total()
            );
            return false;
        }

        let slot = &mut assembly.chunks[index as usize];
        if slot.is_some() {
            debug!("duplicate chunk {} for assembly {} - dropping", index, base_id);
        }
        else {
            *slot = Some(data);
            assembly.received_count += 1;
        }

        assembly.is_complete()
    }

    /// Removes a completed assembly and returns its concatenated payload
    /// bytes, codec and origin. None unless every slot is filled, or when a
    /// slot fails base64 decoding (the assembly is discarded then - the
    /// sender's retries cover it).
    pub fn take_assembled(&mut self, base_id: &str) -> Option<(Bytes, CodecId, SocketAddr)> {
        if !self.assemblies.get(base_id)?.is_complete() {
            return None;
        }
        let assembly = self.assemblies.remove(base_id)
            .expect("assembly checked above");

        let mut data = Vec::new();
        for (index, slot) in assembly.chunks.iter().enumerate() {
            let encoded = slot.as_ref().expect("complete assembly has no empty slots");
            match BASE64.decode(encoded) {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    warn!("chunk {} of assembly {} is not valid base64 - discarding message: {}", index, base_id, e);
                    return None;
                }
            }
        }

        Some((Bytes::from(data), assembly.codec, assembly.remote))
    }

    /// Discards assemblies older than `timeout`. Returns how many were
    /// removed. No negative acknowledgement is sent for them.
    pub fn cleanup_stale(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let before = self.assemblies.len();

        self.assemblies.retain(|base_id, assembly| {
            let stale = now.duration_since(assembly.created_at) > timeout;
            if stale {
                debug!(
                    "discarding stale assembly {} ({}/{} chunks received)",
                    base_id, assembly.received_count, assembly.total()
                );
            }
            !stale
        });

        before - self.assemblies.len()
    }

    pub fn clear(&mut self) {
        self.assemblies.clear();
    }

    #[cfg(test)]
    fn received_count(&self, base_id: &str) -> u32 {
        self.assemblies[base_id].received_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn remote() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[rstest]
    #[case::two_chunks(2000, 1200, 2)]
    #[case::exact_fit(1200, 1200, 1)]
    #[case::one_byte_over(1201, 1200, 2)]
    #[case::exact_multiple(2400, 1200, 2)]
    #[case::empty(0, 1200, 0)]
    #[case::tiny_chunks(10, 3, 4)]
    fn test_create_chunks_count(#[case] len: usize, #[case] chunk_size: usize, #[case] expected: usize) {
        let data = vec![b'a'; len];
        assert_eq!(create_chunks(&data, chunk_size).len(), expected);
    }

    #[test]
    fn test_chunks_concatenate_to_original() {
        let data: Vec<u8> = (0..=255).cycle().take(5000).collect();
        let chunks = create_chunks(&data, 1200);

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            reassembled.extend_from_slice(&BASE64.decode(chunk).unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_reassemble() {
        let data = b"abcdefghij".to_vec();
        let chunks = create_chunks(&data, 3);

        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", chunks.len() as u32, remote(), CodecId::None);

        for index in [2usize, 0, 3] {
            assert!(!reassembler.add_chunk("1", index as u32, chunks[index].clone()));
        }
        assert!(reassembler.add_chunk("1", 1, chunks[1].clone()));

        let (bytes, codec, from) = reassembler.take_assembled("1").unwrap();
        assert_eq!(&bytes[..], data.as_slice());
        assert_eq!(codec, CodecId::None);
        assert_eq!(from, remote());
    }

    #[tokio::test]
    async fn test_duplicate_chunks_are_idempotent() {
        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", 3, remote(), CodecId::None);

        assert!(!reassembler.add_chunk("1", 0, BASE64.encode(b"a")));
        assert!(!reassembler.add_chunk("1", 0, BASE64.encode(b"a")));
        assert!(!reassembler.add_chunk("1", 0, BASE64.encode(b"DIFFERENT")));
        assert_eq!(reassembler.received_count("1"), 1);

        assert!(!reassembler.add_chunk("1", 1, BASE64.encode(b"b")));
        assert!(reassembler.add_chunk("1", 2, BASE64.encode(b"c")));
        assert_eq!(reassembler.received_count("1"), 3);

        let (bytes, _, _) = reassembler.take_assembled("1").unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn test_incomplete_assembly_is_not_delivered() {
        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", 2, remote(), CodecId::None);
        reassembler.add_chunk("1", 0, BASE64.encode(b"a"));

        assert!(reassembler.take_assembled("1").is_none());
        assert!(reassembler.has_assembly("1"));
    }

    #[tokio::test]
    async fn test_take_removes_the_assembly() {
        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", 1, remote(), CodecId::None);
        assert!(reassembler.add_chunk("1", 0, BASE64.encode(b"a")));

        assert!(reassembler.take_assembled("1").is_some());
        assert!(reassembler.take_assembled("1").is_none());
        assert!(!reassembler.has_assembly("1"));
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_assembly_is_dropped() {
        let mut reassembler = Reassembler::new();
        assert!(!reassembler.add_chunk("missing", 0, BASE64.encode(b"a")));
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_dropped() {
        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", 2, remote(), CodecId::None);

        assert!(!reassembler.add_chunk("1", 2, BASE64.encode(b"x")));
        assert_eq!(reassembler.received_count("1"), 0);
    }

    #[tokio::test]
    async fn test_init_assembly_is_first_wins() {
        let mut reassembler = Reassembler::new();
        reassembler.init_assembly("1", 2, remote(), CodecId::Gzip);
        reassembler.init_assembly("1", 5, remote(), CodecId::None);

        reassembler.add_chunk("1", 0, BASE64.encode(b"a"));
        assert!(reassembler.add_chunk("1", 1, BASE64.encode(b"b")));

        let (_, codec, _) = reassembler.take_assembled("1").unwrap();
        assert_eq!(codec, CodecId::Gzip);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_discards_only_stale_assemblies() {
        let timeout = Duration::from_millis(30000);
        let mut reassembler = Reassembler::new();

        reassembler.init_assembly("old", 2, remote(), CodecId::None);
        tokio::time::advance(Duration::from_millis(20000)).await;
        reassembler.init_assembly("fresh", 2, remote(), CodecId::None);
        tokio::time::advance(Duration::from_millis(15000)).await;

        assert_eq!(reassembler.cleanup_stale(timeout), 1);
        assert!(!reassembler.has_assembly("old"));
        assert!(reassembler.has_assembly("fresh"));
    }
}
