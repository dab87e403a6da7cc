//! Infrastructure layer: concrete transport and OS integration.

pub mod signal;
pub mod websocket;

pub use signal::watch_interrupt;
pub use websocket::{ContextOptions, MAX_PENDING_REJECTIONS, WsTransport};
