//! Duplex relay between a WebSocket peer and the local text console.
//!
//! Lines typed on the console are sent to the connected peer as text
//! messages; messages from the peer are printed to stderr prefixed with
//! `"> "`. The transport runs on its own thread and exchanges messages with
//! the console through two queues.

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;

pub mod error;
