use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use serde_json::Value;

/// This trait decouples the protocol engine from the application layer that
///  consumes messages. It is passed around as an `Arc<dyn ...>`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// One logical message, after reassembly and decompression. `request_id`
    /// is the id to answer with via [`crate::engine::ReliableSocket::send_response`].
    async fn on_message(&self, body: Value, remote: SocketAddr, request_id: String);

    /// A datagram that is not a protocol envelope, forwarded raw.
    async fn on_passthrough(&self, raw: Bytes, remote: SocketAddr);
}
