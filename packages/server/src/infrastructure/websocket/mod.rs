//! WebSocket transport built on tokio-tungstenite.

pub mod connection;
pub mod context;
pub mod deflate;
pub mod handshake;

pub use context::{ContextOptions, MAX_PENDING_REJECTIONS, WsTransport};
pub use deflate::{PERMESSAGE_DEFLATE, PERMESSAGE_DEFLATE_PARAMS, permessage_deflate};
pub use handshake::{FRAMED_EXTENSIONS, HandshakeOutcome};
