//! Gateway routing headers
//!
//! Clients describe each request with a fixed set of headers. They are parsed
//! into a `RoutingContext` at admission and stripped, together with the
//! caller's own `authorization`, before anything is forwarded upstream.

use axum::http::{HeaderMap, HeaderValue, header};
use device_auth::RollingTokenVerifier;
use key_pool::{ModelKind, QueryType, RoutingContext};

use crate::error::ApiError;

pub const DEVICE_ID: &str = "device-id";
pub const TYPE_QUERY: &str = "type-query";
pub const TYPE_MODEL: &str = "type-model";
pub const APP_NAME: &str = "app-name";
pub const BANDL_ID: &str = "bandl-id";
const AUTHORIZATION: &str = "authorization";

/// Headers that are consumed by the gateway and never reach upstream.
const GATEWAY_HEADERS: &[&str] = &[DEVICE_ID, TYPE_QUERY, TYPE_MODEL, APP_NAME, BANDL_ID];

/// Headers to strip in both directions (hop-by-hop per RFC 2616 Section 13.5.1, plus host)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Content negotiation the gateway settles itself: responses are metered as
/// they stream, so upstream must answer in identity encoding.
const NEGOTIATED_HEADERS: &[&str] = &["accept-encoding"];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_gateway_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(AUTHORIZATION)
        || GATEWAY_HEADERS
            .iter()
            .chain(NEGOTIATED_HEADERS)
            .any(|h| h.eq_ignore_ascii_case(name))
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ApiError> {
    optional(headers, name)?.ok_or_else(|| ApiError::BadRequest(format!("missing header: {name}")))
}

fn optional<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest(format!("malformed header: {name}")))?
                .trim();
            Ok((!value.is_empty()).then_some(value))
        }
    }
}

/// Parse the routing context for a proxied request.
pub fn routing_context(headers: &HeaderMap) -> Result<RoutingContext, ApiError> {
    let device_id = required(headers, DEVICE_ID)?;
    let query_type: QueryType = required(headers, TYPE_QUERY)?.parse()?;
    let model: ModelKind = required(headers, TYPE_MODEL)?.parse()?;
    let app_name = required(headers, APP_NAME)?;
    let pin_key = optional(headers, BANDL_ID)?;

    Ok(RoutingContext {
        device_id: device_id.to_string(),
        app_name: app_name.to_string(),
        model,
        query_type,
        pin_key: pin_key.map(str::to_string),
    })
}

/// Verify the rolling device token carried in `authorization`.
///
/// A gateway started with device auth disabled passes `None` and every
/// request is accepted.
pub fn authenticate(
    verifier: Option<&RollingTokenVerifier>,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(verifier) = verifier else {
        return Ok(());
    };
    let device_id = required(headers, DEVICE_ID)?;
    let token = required(headers, AUTHORIZATION)?;
    verifier.verify(device_id, token)?;
    Ok(())
}

/// Build the upstream request headers: drop gateway, hop-by-hop and
/// encoding-negotiation headers, then inject the selected credential as a bearer token.
pub fn upstream_headers(inbound: &HeaderMap, api_key: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if !is_hop_by_hop(name.as_str()) && !is_gateway_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|e| ApiError::Internal(format!("invalid upstream credential: {e}")))?;
    bearer.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, bearer);
    Ok(headers)
}
