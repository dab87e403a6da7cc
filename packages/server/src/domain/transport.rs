//! Transport abstraction driven by the service loop.
//!
//! The service loop owns a [`Transport`] and calls [`Transport::service`] once
//! per tick. While servicing, the transport reports connection events to a
//! [`ProtocolHandler`]; those callbacks run synchronously on the service loop
//! thread and never concurrently with each other.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::Notify;

use super::{Message, TransportError};

/// Identity of an established peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    /// Negotiated sub-protocol; `None` when the peer offered none.
    pub protocol: Option<String>,
}

/// Statistics of a connection, reported when it closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub peer: PeerInfo,
    pub received: usize,
    pub sent: usize,
    /// Whether the WebSocket close handshake completed.
    pub graceful: bool,
}

impl ConnectionSummary {
    /// At least one message travelled in each direction.
    pub fn completed_exchange(&self) -> bool {
        self.received > 0 && self.sent > 0
    }
}

/// Protocol callbacks invoked by the transport.
pub trait ProtocolHandler {
    /// A peer finished the upgrade handshake.
    fn on_established(&mut self, peer: &PeerInfo);

    /// The transport can accept outbound frames. The returned messages are
    /// transmitted in order, one text frame each.
    fn on_writable(&mut self) -> Vec<Message>;

    /// A complete message arrived from the peer.
    fn on_receive(&mut self, peer: &PeerInfo, message: Message);

    /// Messages returned by [`on_writable`] that never reached the peer,
    /// oldest first.
    ///
    /// [`on_writable`]: ProtocolHandler::on_writable
    fn on_undelivered(&mut self, messages: Vec<Message>);

    /// A connection went away.
    fn on_closed(&mut self, summary: &ConnectionSummary);
}

/// Single-threaded WebSocket event machinery.
pub trait Transport: Send {
    /// Service pending network I/O, waiting at most `timeout` for something
    /// to happen.
    ///
    /// An `Err` is an unrecoverable transport failure.
    fn service(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError>;

    /// Run the close handshake on open connections, waiting at most `timeout`.
    ///
    /// No message frames are transmitted; `on_writable` is never called.
    fn close_all(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError>;
}

/// Cross-thread request for a writable callback.
///
/// Cloned into the console input thread; a request made while the service
/// loop is not waiting is remembered and consumed by the next tick.
#[derive(Debug, Clone, Default)]
pub struct WritableWaker {
    notify: Arc<Notify>,
}

impl WritableWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_writable(&self) {
        self.notify.notify_one();
    }

    /// Resolves once a writable callback has been requested.
    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}
