//! Relay use cases: the transport service loop, the console bridge and the
//! console input loop.

pub mod console_bridge;
pub mod console_input;
pub mod service_loop;

pub use console_bridge::{BRIDGE_INTERVAL, ConsoleBridge};
pub use console_input::{ConsoleInputLoop, ConsoleLine, InputEnd, LineSource};
pub use service_loop::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_TICK, RelayHandler, ServiceLoop};
