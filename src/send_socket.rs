use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced
///  to facilitate mocking the I/O part away for testing.
///
/// Send errors are logged and swallowed here: the protocol's retries and
/// timeouts cover a lost datagram the same way they cover one the network
/// dropped.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_datagram(&self, to: SocketAddr, buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
