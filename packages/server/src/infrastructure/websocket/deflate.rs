//! `permessage-deflate` negotiation callback (RFC 7692 §7.1).

use crate::domain::{ExtensionOffer, ExtensionParam, ExtensionSpec};

/// Extension name.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Parameters advertised by the relay.
///
/// The peer must drop its compression context after every message, which keeps
/// the per-connection inflate memory small on the relay side.
pub const PERMESSAGE_DEFLATE_PARAMS: &str =
    "permessage-deflate; client_no_context_takeover; client_max_window_bits";

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// Extension entry for the relay's compression extension.
pub fn permessage_deflate() -> ExtensionSpec {
    ExtensionSpec::new(
        PERMESSAGE_DEFLATE,
        negotiate_permessage_deflate,
        PERMESSAGE_DEFLATE_PARAMS,
    )
}

fn window_bits(value: Option<&str>) -> Option<u8> {
    value
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|bits| (8..=15).contains(bits))
}

/// Validate an offer. Unknown, duplicated or malformed parameters make the
/// whole offer unacceptable.
fn offer_is_valid(params: &[ExtensionParam]) -> bool {
    params.iter().enumerate().all(|(index, param)| {
        let unique = !params[..index].iter().any(|other| other.name == param.name);
        let well_formed = match param.name.as_str() {
            SERVER_NO_CONTEXT_TAKEOVER | CLIENT_NO_CONTEXT_TAKEOVER => param.value.is_none(),
            SERVER_MAX_WINDOW_BITS => window_bits(param.value.as_deref()).is_some(),
            CLIENT_MAX_WINDOW_BITS => {
                param.value.is_none() || window_bits(param.value.as_deref()).is_some()
            }
            _ => false,
        };
        unique && well_formed
    })
}

/// Accept or decline an offer.
///
/// An accepted offer is answered with the relay's own flags followed by the
/// offered parameters. A bare `client_max_window_bits` only announces client
/// support and is never echoed. No window sizes are computed because frames
/// are not compressed by this transport.
pub fn negotiate_permessage_deflate(offer: &ExtensionOffer, spec: &ExtensionSpec) -> Option<String> {
    if !offer.name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) || !offer_is_valid(&offer.params) {
        return None;
    }

    let echoed = |param: &ExtensionParam| {
        param.value.is_some() || param.name != CLIENT_MAX_WINDOW_BITS
    };
    let flags = spec
        .parsed_params()
        .into_iter()
        .filter(|param| param.value.is_none() && echoed(param));
    let offered = offer.params.iter().filter(|&param| echoed(param)).cloned();

    let mut response: Vec<ExtensionParam> = Vec::new();
    for param in flags.chain(offered) {
        if !response.iter().any(|seen| seen.name == param.name) {
            response.push(param);
        }
    }

    Some(
        std::iter::once(PERMESSAGE_DEFLATE.to_string())
            .chain(response.into_iter().map(|param| match param.value {
                Some(value) => format!("{}={}", param.name, value),
                None => param.name,
            }))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
