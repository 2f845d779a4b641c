use std::fmt::{Display, Formatter};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// 2024-01-01T00:00:00Z in unix millis - the epoch all id timestamps are
/// relative to. Part of the wire contract: peers parsing ids for diagnostics
/// must use the same epoch.
pub const ID_EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_SHIFT: u32 = WORKER_ID_BITS + SEQUENCE_BITS;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// A snowflake-style message id: 42 bits of epoch-relative timestamp, 10 bits
/// of worker id, 12 bits of per-millisecond sequence. Ids generated by one
/// process are strictly increasing; ids generated by processes with distinct
/// worker ids never collide.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageId(u64);

impl MessageId {
    pub fn from_raw(value: u64) -> MessageId {
        MessageId(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// Inverse of generation, for diagnostics and log correlation.
    pub fn parse(&self) -> ParsedMessageId {
        ParsedMessageId {
            timestamp_ms: (self.0 >> TIMESTAMP_SHIFT) + ID_EPOCH_MS,
            worker_id: ((self.0 >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16,
            sequence: (self.0 & SEQUENCE_MASK) as u16,
        }
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ParsedMessageId {
    pub timestamp_ms: u64,
    pub worker_id: u16,
    pub sequence: u16,
}

struct GeneratorState {
    last_timestamp_ms: u64,
    sequence: u64,
}

/// Generates unique message ids. Safe to share between tasks; concurrent
/// callers are serialized on the internal state and always observe distinct
/// ids.
pub struct MessageIdGenerator {
    worker_id: u64,
    state: Mutex<GeneratorState>,
}

impl MessageIdGenerator {
    pub fn new(worker_id: u16) -> Result<MessageIdGenerator, ProtocolError> {
        if worker_id > MAX_WORKER_ID {
            return Err(ProtocolError::InvalidWorkerId(worker_id));
        }
        Ok(MessageIdGenerator {
            worker_id: worker_id as u64,
            state: Mutex::new(GeneratorState {
                last_timestamp_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn generate(&self) -> Result<MessageId, ProtocolError> {
        let mut state = self.state.lock()
            .expect("id generator state poisoned");

        let mut now = Self::current_millis();
        if now < state.last_timestamp_ms {
            return Err(ProtocolError::ClockBackwards {
                behind_ms: state.last_timestamp_ms - now,
            });
        }

        if now == state.last_timestamp_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // sequence exhausted for this millisecond - spin until the
                // clock moves on
                while now <= state.last_timestamp_ms {
                    now = Self::current_millis();
                }
            }
        }
        else {
            state.sequence = 0;
        }
        state.last_timestamp_ms = now;

        Ok(MessageId(
            ((now - ID_EPOCH_MS) << TIMESTAMP_SHIFT)
                | (self.worker_id << SEQUENCE_BITS)
                | state.sequence,
        ))
    }

    fn current_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }
}

/// Wire form of the id of chunk `index` of the logical message `base_id`.
pub fn chunk_id(base_id: &str, index: u32) -> String {
    format!("{}-chunk-{}", base_id, index)
}

/// Recovers `(base_id, index)` from a chunk id, or None if the id does not
/// carry the `-chunk-<index>` suffix.
pub fn split_chunk_id(id: &str) -> Option<(&str, u32)> {
    let pos = id.rfind("-chunk-")?;
    let index: u32 = id[pos + "-chunk-".len()..].parse().ok()?;
    Some((&id[..pos], index))
}
