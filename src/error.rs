use thiserror::Error;

/// Error kinds that cross the engine's API boundary.
///
/// The protocol recovers from most failures internally - checksum mismatches
/// and abandoned reassemblies are dropped silently and covered by the sender's
/// retries. What remains is either fatal to a single request or fatal to the
/// engine, and those are the variants here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("worker id {0} out of range 0..=1023")]
    InvalidWorkerId(u16),

    /// Fatal to the id generator instance that observed it.
    #[error("system clock moved backwards, {behind_ms}ms behind the last observed timestamp")]
    ClockBackwards { behind_ms: u64 },

    /// The request did not resolve before `request_timeout`.
    #[error("request {0} timed out")]
    RequestTimeout(String),

    /// The engine was closed while the request was outstanding.
    #[error("socket closed")]
    Closed,
}
