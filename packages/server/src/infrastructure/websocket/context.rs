//! Transport context: listener, connection and runtime of the service loop.
//!
//! The context owns a current-thread tokio runtime. Each call to
//! [`Transport::service`] drives that runtime for one bounded tick, so all
//! connection tasks and protocol callbacks execute on the service loop thread.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Runtime},
    sync::mpsc::{self, error::SendError},
};

use crate::domain::{
    ConnectionSummary, NegotiationConfig, PeerInfo, ProtocolHandler, Transport, TransportError,
    WritableWaker,
};

use super::{
    connection::{ConnectionEvent, Outgoing, run_connection},
    handshake::FRAMED_EXTENSIONS,
};

/// Pause after an accept failure caused by resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Refusals (503 handshakes) allowed in flight; later peers are dropped
/// without a response.
pub const MAX_PENDING_REJECTIONS: usize = 8;

#[cfg(windows)]
const EXHAUSTION_CODES: &[i32] = &[10024, 10055]; // WSAEMFILE, WSAENOBUFS
#[cfg(any(target_os = "linux", target_os = "android"))]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 105]; // ENFILE, EMFILE, ENOBUFS
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 55]; // ENFILE, EMFILE, ENOBUFS

/// Settings read once when the context is created.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// `host:port` to listen on; port `0` picks an ephemeral port.
    pub bind_addr: String,
    pub negotiation: Arc<NegotiationConfig>,
}

struct ActiveConnection {
    peer: PeerInfo,
    writer: mpsc::UnboundedSender<Outgoing>,
    received: usize,
    sent: usize,
}

impl ActiveConnection {
    fn summary(&self, graceful: bool) -> ConnectionSummary {
        ConnectionSummary {
            peer: self.peer.clone(),
            received: self.received,
            sent: self.sent,
            graceful,
        }
    }
}

enum Wakeup {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Event(ConnectionEvent),
    Writable,
    Idle,
}

/// Out of descriptors, buffers or memory. Clears once connections go away.
fn is_resource_exhaustion(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::OutOfMemory
        || error
            .raw_os_error()
            .is_some_and(|code| EXHAUSTION_CODES.contains(&code))
}

fn is_transient(error: &io::Error) -> bool {
    is_resource_exhaustion(error)
        || matches!(
            error.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
        )
}

/// State touched while the runtime is being driven.
struct ContextIo {
    listener: TcpListener,
    local_addr: SocketAddr,
    negotiation: Arc<NegotiationConfig>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    connection: Option<ActiveConnection>,
    pending_handshakes: usize,
    pending_rejections: usize,
    next_id: u64,
    waker: WritableWaker,
    closing: bool,
}

impl ContextIo {
    async fn service(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError> {
        let wakeup = tokio::select! {
            accepted = self.listener.accept() => Wakeup::Accepted(accepted),
            Some(event) = self.events_rx.recv() => Wakeup::Event(event),
            _ = self.waker.requested() => Wakeup::Writable,
            _ = tokio::time::sleep(timeout) => Wakeup::Idle,
        };

        match wakeup {
            Wakeup::Accepted(Ok((stream, addr))) => self.accept(stream, addr),
            Wakeup::Accepted(Err(e)) if is_resource_exhaustion(&e) => {
                tracing::warn!("Accept failed, backing off: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF.min(timeout)).await;
            }
            Wakeup::Accepted(Err(e)) if is_transient(&e) => {
                tracing::warn!("Transient accept error: {}", e);
            }
            Wakeup::Accepted(Err(e)) => return Err(TransportError::Accept(e)),
            Wakeup::Event(event) => self.dispatch(event, handler),
            Wakeup::Writable => self.flush_writable(handler),
            Wakeup::Idle => {}
        }

        // Dispatch whatever else is already pending without waiting again
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event, handler);
        }

        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        let busy = self.closing || self.connection.is_some() || self.pending_handshakes > 0;
        if busy && self.pending_rejections >= MAX_PENDING_REJECTIONS {
            tracing::warn!(
                "Dropping connection #{} from {}: {} refusals already in flight",
                id,
                addr,
                self.pending_rejections
            );
            return;
        }
        if busy {
            self.pending_rejections += 1;
        } else {
            self.pending_handshakes += 1;
        }
        tracing::debug!("Accepted TCP connection #{} from {} (busy: {})", id, addr, busy);

        tokio::spawn(run_connection(
            stream,
            addr,
            id,
            self.negotiation.clone(),
            busy,
            self.events_tx.clone(),
        ));
    }

    fn dispatch(&mut self, event: ConnectionEvent, handler: &mut dyn ProtocolHandler) {
        match event {
            ConnectionEvent::Established {
                peer,
                writer,
                outcome,
            } => {
                self.pending_handshakes = self.pending_handshakes.saturating_sub(1);

                for declined in &outcome.declined_extensions {
                    tracing::info!(
                        "Extension '{}' agreed with {} as '{}' but declined: frames are sent uncompressed",
                        declined.name,
                        peer.addr,
                        declined.response
                    );
                }

                if self.connection.is_some() {
                    tracing::warn!("Closing surplus connection from {}", peer.addr);
                    let _ = writer.send(Outgoing::Close);
                    return;
                }

                tracing::info!(
                    "Connection established with {} (protocol: {})",
                    peer.addr,
                    peer.protocol.as_deref().unwrap_or("default")
                );
                handler.on_established(&peer);
                self.connection = Some(ActiveConnection {
                    peer,
                    writer,
                    received: 0,
                    sent: 0,
                });

                if self.closing {
                    self.request_close();
                } else {
                    // Lines typed before the peer connected are still queued
                    self.flush_writable(handler);
                }
            }
            ConnectionEvent::HandshakeFailed {
                id,
                addr,
                rejection,
            } => {
                if rejection {
                    self.pending_rejections = self.pending_rejections.saturating_sub(1);
                } else {
                    self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
                }
                tracing::debug!("Connection #{} from {} was never established", id, addr);
            }
            ConnectionEvent::Received { id, message } => match self.connection.as_mut() {
                Some(connection) if connection.peer.id == id => {
                    connection.received += 1;
                    handler.on_receive(&connection.peer, message);
                }
                _ => tracing::debug!("Dropping message from stale connection #{}", id),
            },
            ConnectionEvent::Delivered { id } => match self.connection.as_mut() {
                Some(connection) if connection.peer.id == id => connection.sent += 1,
                _ => tracing::debug!("Delivery report from stale connection #{}", id),
            },
            ConnectionEvent::Closed {
                id,
                graceful,
                unsent,
            } => {
                if !unsent.is_empty() {
                    tracing::info!(
                        "Requeueing {} messages not delivered on connection #{}",
                        unsent.len(),
                        id
                    );
                    handler.on_undelivered(unsent);
                }
                self.close_connection(id, graceful, handler);
            }
        }
    }

    fn close_connection(&mut self, id: u64, graceful: bool, handler: &mut dyn ProtocolHandler) {
        match self.connection.take() {
            Some(connection) if connection.peer.id == id => {
                tracing::info!(
                    "Connection with {} closed (graceful: {})",
                    connection.peer.addr,
                    graceful
                );
                handler.on_closed(&connection.summary(graceful));
            }
            other => self.connection = other,
        }
    }

    /// Hand the outbound batch to the active connection's writer.
    ///
    /// Without an established connection nothing is drained, so queued
    /// messages wait for the next peer. Messages the writer no longer accepts
    /// go back to the handler. `sent` is only counted once the writer reports
    /// a frame as delivered.
    fn flush_writable(&mut self, handler: &mut dyn ProtocolHandler) {
        if self.closing {
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };

        let mut undelivered = Vec::new();
        for message in handler.on_writable() {
            if let Err(SendError(Outgoing::Text(message))) =
                connection.writer.send(Outgoing::Text(message))
            {
                undelivered.push(message);
            }
        }

        if !undelivered.is_empty() {
            tracing::warn!(
                "Writer for {} is gone; requeueing {} messages",
                connection.peer.addr,
                undelivered.len()
            );
            handler.on_undelivered(undelivered);
        }
    }

    fn request_close(&self) {
        if let Some(connection) = &self.connection {
            tracing::info!("Closing connection with {}", connection.peer.addr);
            let _ = connection.writer.send(Outgoing::Close);
        }
    }

    async fn close_all(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError> {
        self.closing = true;
        self.request_close();

        let drained = tokio::time::timeout(timeout, async {
            while self.connection.is_some() || self.pending_handshakes > 0 {
                match self.events_rx.recv().await {
                    Some(event) => self.dispatch(event, &mut *handler),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err()
            && let Some(connection) = self.connection.take()
        {
            tracing::warn!(
                "Close handshake with {} did not complete within {:?}",
                connection.peer.addr,
                timeout
            );
            handler.on_closed(&connection.summary(false));
        }

        Ok(())
    }
}

/// WebSocket transport context backed by tokio-tungstenite.
pub struct WsTransport {
    runtime: Runtime,
    io: ContextIo,
}

impl WsTransport {
    /// Create the context: build the runtime and bind the listener.
    ///
    /// Must be called outside of any tokio runtime.
    pub fn create(options: ContextOptions) -> Result<Self, TransportError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;

        let listener = runtime
            .block_on(TcpListener::bind(&options.bind_addr))
            .map_err(|source| TransportError::Bind {
                addr: options.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(TransportError::LocalAddr)?;

        let negotiation = options.negotiation;
        tracing::info!(
            "Transport context listening on {} (protocol: {}, options: {:#x})",
            local_addr,
            negotiation.protocol(),
            negotiation.options().bits()
        );
        for extension in negotiation.extensions() {
            if FRAMED_EXTENSIONS.contains(&extension.name()) {
                tracing::info!("Advertising extension '{}'", extension.params());
            } else {
                tracing::info!(
                    "Advertising extension '{}'; agreements will be declined, frames are uncompressed",
                    extension.params()
                );
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            io: ContextIo {
                listener,
                local_addr,
                negotiation,
                events_tx,
                events_rx,
                connection: None,
                pending_handshakes: 0,
                pending_rejections: 0,
                next_id: 1,
                waker: WritableWaker::new(),
                closing: false,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.io.local_addr
    }

    /// Handle other threads use to request a writable callback.
    pub fn waker(&self) -> WritableWaker {
        self.io.waker.clone()
    }

    pub fn negotiation(&self) -> &NegotiationConfig {
        &self.io.negotiation
    }

    /// Run a background task on the context's runtime. It makes progress
    /// while the service loop is ticking.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

impl Transport for WsTransport {
    fn service(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError> {
        self.runtime.block_on(self.io.service(timeout, handler))
    }

    fn close_all(
        &mut self,
        timeout: Duration,
        handler: &mut dyn ProtocolHandler,
    ) -> Result<(), TransportError> {
        self.runtime.block_on(self.io.close_all(timeout, handler))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        tracing::debug!("Transport context on {} destroyed", self.io.local_addr);
    }
}
