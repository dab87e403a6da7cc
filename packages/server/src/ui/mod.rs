//! Terminal-facing side of the relay.

pub mod console;
pub mod relay;

pub use console::{Console, PROMPT};
pub use relay::{Relay, RelayConfig};
