//! Sub-protocol and extension negotiation config.
//!
//! A [`NegotiationConfig`] is built once at startup, wrapped in an `Arc` and
//! handed to the transport when its context is created. The type has no
//! mutating methods after construction: the transport reads it at context
//! creation and for every handshake, and nothing may change it in between.

use super::{NegotiationError, ShutdownView};

/// Name of the single application sub-protocol the relay speaks.
pub const RELAY_PROTOCOL: &str = "lws-minimal-server-echo";

/// Bitmask value of [`ProtocolOptions::once`].
pub const OPTION_ONCE: u32 = 1;

/// Per-vhost protocol options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// Start shutdown when the first peer connection closes.
    pub once: bool,
}

impl ProtocolOptions {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            once: bits & OPTION_ONCE != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        if self.once { OPTION_ONCE } else { 0 }
    }
}

/// One `name[=value]` parameter of an extension offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    pub name: String,
    pub value: Option<String>,
}

/// One extension entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Parse a single `name; param; param=value` element.
    pub fn parse(element: &str) -> Option<Self> {
        let mut parts = element.split(';').map(str::trim);
        let name = parts.next().filter(|name| !name.is_empty())?;
        let params = parts
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((name, value)) => ExtensionParam {
                    name: name.trim().to_string(),
                    value: Some(value.trim().trim_matches('"').to_string()),
                },
                None => ExtensionParam {
                    name: part.to_string(),
                    value: None,
                },
            })
            .collect();
        Some(Self {
            name: name.to_string(),
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|param| param.name == name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }
}

/// Parse a full `Sec-WebSocket-Extensions` header value into its offers.
pub fn parse_extension_offers(header: &str) -> Vec<ExtensionOffer> {
    header.split(',').filter_map(ExtensionOffer::parse).collect()
}

/// Evaluates a client offer against the extension's configured parameters.
///
/// Returns the response element (e.g. `permessage-deflate; client_no_context_takeover`)
/// when the offer is acceptable.
pub type ExtensionNegotiator = fn(offer: &ExtensionOffer, spec: &ExtensionSpec) -> Option<String>;

/// An extension the relay advertises.
#[derive(Debug, Clone)]
pub struct ExtensionSpec {
    name: &'static str,
    negotiate: ExtensionNegotiator,
    params: &'static str,
}

impl ExtensionSpec {
    pub fn new(name: &'static str, negotiate: ExtensionNegotiator, params: &'static str) -> Self {
        Self {
            name,
            negotiate,
            params,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The configured parameter string, e.g.
    /// `permessage-deflate; client_no_context_takeover; client_max_window_bits`.
    pub fn params(&self) -> &'static str {
        self.params
    }

    /// The configured parameters, without the leading extension name.
    pub fn parsed_params(&self) -> Vec<ExtensionParam> {
        ExtensionOffer::parse(self.params)
            .map(|offer| offer.params)
            .unwrap_or_default()
    }

    pub fn negotiate(&self, offer: &ExtensionOffer) -> Option<String> {
        (self.negotiate)(offer, self)
    }
}

/// Outcome of negotiating one advertised extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionAgreement {
    pub name: &'static str,
    /// Response element to send back in `Sec-WebSocket-Extensions`.
    pub response: String,
}

/// Immutable protocol table and extension list read by the transport.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    protocol: String,
    options: ProtocolOptions,
    interrupted: Option<ShutdownView>,
    extensions: Vec<ExtensionSpec>,
}

impl NegotiationConfig {
    pub fn new(protocol: impl Into<String>, options: ProtocolOptions) -> Self {
        Self {
            protocol: protocol.into(),
            options,
            interrupted: None,
            extensions: Vec::new(),
        }
    }

    /// Mirror the relay's shutdown flag. Only available while building the
    /// config.
    pub fn with_shutdown(mut self, view: ShutdownView) -> Self {
        self.interrupted = Some(view);
        self
    }

    /// Advertise an extension. Only available while building the config.
    pub fn with_extension(mut self, extension: ExtensionSpec) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn options(&self) -> ProtocolOptions {
        self.options
    }

    /// Whether the mirrored shutdown flag has left `running`. Always `false`
    /// without a mirror.
    pub fn interrupted(&self) -> bool {
        self.interrupted
            .as_ref()
            .is_some_and(ShutdownView::is_interrupted)
    }

    pub fn extensions(&self) -> &[ExtensionSpec] {
        &self.extensions
    }

    /// Pick the sub-protocol for a handshake.
    ///
    /// No offer binds the connection to the default protocol without echoing a
    /// name. An offer list must contain the supported protocol.
    pub fn select_protocol(&self, offered: Option<&str>) -> Result<Option<&str>, NegotiationError> {
        let Some(offered) = offered.map(str::trim).filter(|offered| !offered.is_empty()) else {
            return Ok(None);
        };

        if offered
            .split(',')
            .map(str::trim)
            .any(|name| name == self.protocol)
        {
            Ok(Some(self.protocol.as_str()))
        } else {
            Err(NegotiationError::UnsupportedProtocol {
                offered: offered.to_string(),
                supported: self.protocol.clone(),
            })
        }
    }

    /// Run every advertised extension's negotiator against the client offers.
    ///
    /// For each extension the first acceptable offer wins; offers for unknown
    /// extensions are ignored.
    pub fn negotiate_extensions(&self, header: Option<&str>) -> Vec<ExtensionAgreement> {
        let offers = header.map(parse_extension_offers).unwrap_or_default();

        self.extensions
            .iter()
            .filter_map(|extension| {
                offers
                    .iter()
                    .filter(|offer| offer.name.eq_ignore_ascii_case(extension.name))
                    .find_map(|offer| extension.negotiate(offer))
                    .map(|response| ExtensionAgreement {
                        name: extension.name,
                        response,
                    })
            })
            .collect()
    }
}
