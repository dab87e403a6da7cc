//! Upgrade handshake negotiation against the [`NegotiationConfig`].

use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{HeaderName, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL},
    },
};

use crate::domain::{ExtensionAgreement, NegotiationConfig, NegotiationError};

/// Extensions whose frames this transport can encode and decode.
///
/// tungstenite frames messages uncompressed, so agreements for any other
/// extension are declined in the handshake response (RFC 7692 §5 lets the
/// server decline) and the connection proceeds without it.
pub const FRAMED_EXTENSIONS: &[&str] = &[];

/// What a successful handshake settled on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub protocol: Option<String>,
    pub accepted_extensions: Vec<ExtensionAgreement>,
    pub declined_extensions: Vec<ExtensionAgreement>,
}

/// Join every instance of a request header into one comma-separated value.
fn joined_header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// Negotiate sub-protocol and extensions for one upgrade request.
///
/// `busy` rejects the upgrade because another peer is being served; so does a
/// relay that is shutting down.
pub fn negotiate(
    config: &NegotiationConfig,
    busy: bool,
    request: &Request,
    mut response: Response,
) -> Result<(Response, HandshakeOutcome), ErrorResponse> {
    if config.interrupted() {
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            NegotiationError::ShuttingDown.to_string(),
        ));
    }
    if busy {
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            NegotiationError::Busy.to_string(),
        ));
    }

    let offered_protocols = joined_header(request.headers(), &SEC_WEBSOCKET_PROTOCOL);
    let protocol = config
        .select_protocol(offered_protocols.as_deref())
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?
        .map(str::to_string);

    if let Some(name) = &protocol {
        let value = HeaderValue::from_str(name)
            .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let offered_extensions = joined_header(request.headers(), &SEC_WEBSOCKET_EXTENSIONS);
    let (accepted_extensions, declined_extensions): (Vec<_>, Vec<_>) = config
        .negotiate_extensions(offered_extensions.as_deref())
        .into_iter()
        .partition(|agreement| FRAMED_EXTENSIONS.contains(&agreement.name));

    for agreement in &accepted_extensions {
        let value = HeaderValue::from_str(&agreement.response)
            .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        response.headers_mut().append(SEC_WEBSOCKET_EXTENSIONS, value);
    }

    Ok((
        response,
        HandshakeOutcome {
            protocol,
            accepted_extensions,
            declined_extensions,
        },
    ))
}
