//! Domain layer: relay state shared between threads and the transport seam.

pub mod error;
pub mod message;
pub mod negotiation;
pub mod queue;
pub mod shutdown;
pub mod transport;

pub use error::{NegotiationError, ShutdownError, TransportError};
pub use message::Message;
pub use negotiation::{
    ExtensionAgreement, ExtensionNegotiator, ExtensionOffer, ExtensionParam, ExtensionSpec,
    NegotiationConfig, OPTION_ONCE, ProtocolOptions, RELAY_PROTOCOL, parse_extension_offers,
};
pub use queue::MessageQueue;
pub use shutdown::{ShutdownFlag, ShutdownState, ShutdownView};
pub use transport::{ConnectionSummary, PeerInfo, ProtocolHandler, Transport, WritableWaker};
