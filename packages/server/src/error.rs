//! Error types for the relay orchestration.

use std::io;

use rustyline::error::ReadlineError;
use thiserror::Error;

use crate::domain::TransportError;

/// Console input errors
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The line editor could not be set up
    #[error("Failed to initialize line editor: {0}")]
    Init(#[source] ReadlineError),

    /// Reading a line failed
    #[error("Failed to read console line: {0}")]
    Read(#[source] ReadlineError),
}

/// Top-level relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The console failed
    #[error(transparent)]
    Console(#[from] ConsoleError),

    /// A relay thread could not be started
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// A relay thread panicked
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    /// Writing inbound messages to the console failed
    #[error("Console output failed: {0}")]
    Output(#[source] io::Error),
}
