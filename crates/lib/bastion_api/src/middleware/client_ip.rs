//! Client identity for rate limiting and audit records.
//!
//! Forwarded headers win over the transport address so the limiter works
//! behind a reverse proxy. They are client-controlled and only a soft
//! signal.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::AppState;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Identity used when nothing better is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Derived client identity (normally an IP address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Pick the client identity: first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first_hop) = forwarded {
            return first_hop.to_string();
        }
        let real_ip = headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIdentity(client_identity(
            &parts.headers,
            peer,
            state.config.trust_forwarded_headers,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.9:51234".parse().unwrap())
    }

    #[test]
    fn first_forwarded_hop_wins() {
        let mut h = HeaderMap::new();
        h.insert(X_FORWARDED_FOR, HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        h.insert(X_REAL_IP, HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_identity(&h, peer(), true), "203.0.113.7");
    }

    #[test]
    fn real_ip_when_no_forwarded_for() {
        let mut h = HeaderMap::new();
        h.insert(X_REAL_IP, HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_identity(&h, peer(), true), "198.51.100.2");
    }

    #[test]
    fn peer_address_as_fallback() {
        assert_eq!(client_identity(&HeaderMap::new(), peer(), true), "10.0.0.9");
        assert_eq!(client_identity(&HeaderMap::new(), None, true), UNKNOWN_CLIENT);
    }

    #[test]
    fn forwarded_headers_ignored_when_untrusted() {
        let mut h = HeaderMap::new();
        h.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_identity(&h, peer(), false), "10.0.0.9");
    }
}
