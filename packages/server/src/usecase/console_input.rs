//! Console input loop run on the main thread.

use std::sync::Arc;

use crate::{
    domain::{MessageQueue, ShutdownFlag, WritableWaker},
    error::ConsoleError,
};

/// One result of a blocking console read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Line(String),
    /// End of input (EOF).
    End,
    /// The line editor caught an interrupt key.
    Interrupted,
}

/// Blocking source of console lines.
pub trait LineSource {
    fn read_line(&mut self) -> Result<ConsoleLine, ConsoleError>;
}

/// Why the input loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    /// An empty line was entered.
    Sentinel,
    EndOfInput,
    Interrupted,
    /// Shutdown was started elsewhere.
    ShutdownObserved,
}

pub struct ConsoleInputLoop {
    outbound: Arc<MessageQueue>,
    waker: WritableWaker,
    shutdown: Arc<ShutdownFlag>,
}

impl ConsoleInputLoop {
    pub fn new(
        outbound: Arc<MessageQueue>,
        waker: WritableWaker,
        shutdown: Arc<ShutdownFlag>,
    ) -> Self {
        Self {
            outbound,
            waker,
            shutdown,
        }
    }

    /// Read lines until the sentinel, EOF, an interrupt or a shutdown.
    ///
    /// Each non-empty line is enqueued outbound and followed by a writable
    /// request. A line read after shutdown has started is discarded. The
    /// service loop is always woken on the way out so it observes the flag
    /// without waiting for its tick to elapse.
    pub fn run(&self, source: &mut dyn LineSource) -> Result<InputEnd, ConsoleError> {
        let result = self.read_lines(source);
        if result.is_err() {
            self.interrupt();
        }
        self.waker.request_writable();
        result
    }

    fn read_lines(&self, source: &mut dyn LineSource) -> Result<InputEnd, ConsoleError> {
        loop {
            if !self.shutdown.is_running() {
                return Ok(InputEnd::ShutdownObserved);
            }

            let line = source.read_line()?;

            if !self.shutdown.is_running() {
                if let ConsoleLine::Line(text) = &line {
                    tracing::debug!("Discarding {} bytes typed during shutdown", text.len());
                }
                return Ok(InputEnd::ShutdownObserved);
            }

            match line {
                ConsoleLine::Line(text) if text.is_empty() => {
                    self.finish();
                    return Ok(InputEnd::Sentinel);
                }
                ConsoleLine::Line(text) => {
                    self.outbound.enqueue(text);
                    self.waker.request_writable();
                }
                ConsoleLine::End => {
                    self.finish();
                    return Ok(InputEnd::EndOfInput);
                }
                ConsoleLine::Interrupted => {
                    self.interrupt();
                    return Ok(InputEnd::Interrupted);
                }
            }
        }
    }

    fn finish(&self) {
        match self.shutdown.finish() {
            Ok(()) => tracing::info!("End of console input, shutting down"),
            Err(e) => tracing::debug!("Shutdown already in progress: {}", e),
        }
    }

    fn interrupt(&self) {
        match self.shutdown.interrupt() {
            Ok(()) => tracing::warn!("Console interrupted, shutting down"),
            Err(e) => tracing::debug!("Shutdown already in progress: {}", e),
        }
    }
}
