//! A reliability layer on top of UDP, turning an unreliable, unordered,
//! length-limited datagram channel into a request/response primitive with
//! at-least-once delivery, large-payload support and optional payload
//! compression.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (JSON-compatible
//!   values) rather than streams of bytes; a request resolves with its
//!   response value
//! * At-least-once delivery: every request envelope is retransmitted on a
//!   timer until the peer acknowledges receipt, bounded by a retry budget
//!   and a final request timeout
//! * Messages larger than a single datagram are split into chunks and
//!   reassembled on the receiver, tolerating reordering and duplication
//! * Bodies can be compressed with a pluggable codec when it actually pays
//!   off (size and reduction thresholds)
//! * Explicitly *not* provided: exactly-once delivery, ordering between
//!   independent messages, congestion control, connection state, encryption
//!   --> different trade-offs than TCP or QUIC
//!
//! ## Exchange
//!
//! ```ascii
//! requester                               responder
//!     |---------------- REQ ------------------>|     (retried until ACK)
//!     |<--------------- ACK -------------------|     (before any app work)
//!     |                                        |     (handler runs)
//!     |<--------------- RES -------------------|     (resolves the request)
//! ```
//!
//! An oversized request is sent as `N` chunk envelopes with ids
//! `<base>-chunk-0` .. `<base>-chunk-N-1`, each acknowledged and retried
//! individually; the logical send completes when the last chunk is
//! acknowledged.
//!
//! ## Wire format
//!
//! An envelope is a JSON object with keys `id` (string), `body`, `flags`
//! (integer) and optionally `checksum` (hex SHA-256 of the body), `ci`/`ct`
//! (chunk index / total) and `os`/`cs` (original / compressed size). Chunk
//! bodies are base64 text. The flag byte is bit-exact:
//!
//! ```ascii
//! bit 0-2: codec tag (0=NONE 1=GZIP 2=SNAPPY 3=LZ4 4=ZSTD)
//! bit 3:   compressed
//! bit 4:   chunked
//! bit 5-6: message type (0=REQ 1=ACK 2=RES)
//! bit 7:   reserved - written as zero, ignored by receivers
//! ```
//!
//! ACK envelopes carry only `id` and `flags`; a RES mirrors the id of the
//! request it answers. Datagrams that do not parse as envelopes are handed
//! to the application untouched, so protocol and non-protocol traffic can
//! share a socket.

pub mod chunks;
pub mod codec;
pub mod compress;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod message_id;
pub mod send_socket;
pub mod tracker;

pub use config::{CompressionConfig, SocketConfig};
pub use dispatcher::MessageDispatcher;
pub use engine::ReliableSocket;
pub use envelope::CodecId;
pub use error::ProtocolError;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
