//! Domain error types.

use std::io;

use thiserror::Error;

use super::ShutdownState;

/// Refused shutdown state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// The transition is not part of the shutdown state machine
    #[error("Shutdown cannot move from {from} to {to}")]
    InvalidTransition {
        from: ShutdownState,
        to: ShutdownState,
    },

    /// Another thread changed the state first
    #[error("Shutdown state was expected to be {expected} but is {actual}")]
    Stale {
        expected: ShutdownState,
        actual: ShutdownState,
    },
}

/// Handshake negotiation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// None of the offered sub-protocols is supported
    #[error("Unsupported sub-protocol offer '{offered}' (supported: '{supported}')")]
    UnsupportedProtocol { offered: String, supported: String },

    /// The relay already serves a peer
    #[error("A peer connection is already active")]
    Busy,

    /// Shutdown has started
    #[error("The relay is shutting down")]
    ShuttingDown,
}

/// Unrecoverable transport failure.
///
/// Returned by a service tick; the service loop exits without retrying.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to build the event loop runtime
    #[error("Failed to build transport runtime: {0}")]
    Runtime(#[source] io::Error),

    /// Failed to bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Fatal error while accepting connections
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Failed to query the listening address
    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    /// Unrecoverable condition that is not an I/O error.
    ///
    /// [`WsTransport`] never produces it; other [`Transport`] implementations
    /// report their own failures through it.
    ///
    /// [`WsTransport`]: crate::infrastructure::WsTransport
    /// [`Transport`]: crate::domain::Transport
    #[error("Transport failure: {0}")]
    Failed(String),
}
