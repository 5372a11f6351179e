use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;

use crate::AppState;

/// Real client IP: proxy headers first (in trust order), then the socket
/// peer address. Header values that do not parse as an IP are ignored.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        // may hold "client, proxy1, proxy2"; the leftmost is the client
        if let Some(first) = forwarded.split(',').next() {
            let candidate = first.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    for name in ["x-real-ip", "cf-connecting-ip"] {
        if let Some(value) = header_str(headers, name) {
            let candidate = value.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    peer.ip().to_string()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub(crate) async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| client_ip(req.headers(), *peer))
        .unwrap_or_else(|| "-".to_string());
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        path = %path,
        remote_addr = %remote_addr,
        status = %response.status(),
        "http request"
    );
    response
}

pub(crate) async fn require_basic_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if basic_auth_matches(req.headers(), &state.config.credential) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Basic realm=\"ttygate\"")],
            "authorization failed",
        )
            .into_response()
    }
}

fn basic_auth_matches(headers: &HeaderMap, credential: &str) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let Some(token) = parts.next() else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(payload) = BASE64_ENGINE.decode(token.trim()) else {
        return false;
    };
    payload == credential.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.7:50000".parse().expect("socket addr")
    }

    #[test]
    fn falls_back_to_the_peer_address() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.7");
    }

    #[test]
    fn forwarded_for_wins_and_takes_the_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.5, 10.0.0.1".parse().expect("header"),
        );
        headers.insert("x-real-ip", "10.0.0.2".parse().expect("header"));
        assert_eq!(client_ip(&headers, peer()), "203.0.113.5");
    }

    #[test]
    fn invalid_header_values_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().expect("header"));
        headers.insert("cf-connecting-ip", "198.51.100.9".parse().expect("header"));
        assert_eq!(client_ip(&headers, peer()), "198.51.100.9");
    }

    #[test]
    fn basic_auth_requires_matching_credential() {
        let mut headers = HeaderMap::new();
        let token = BASE64_ENGINE.encode("user:secret");
        headers.insert(
            AUTHORIZATION,
            format!("Basic {token}").parse().expect("header"),
        );
        assert!(basic_auth_matches(&headers, "user:secret"));
        assert!(!basic_auth_matches(&headers, "user:other"));
    }

    #[test]
    fn basic_auth_rejects_missing_or_malformed_headers() {
        assert!(!basic_auth_matches(&HeaderMap::new(), "user:secret"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().expect("header"));
        assert!(!basic_auth_matches(&headers, "user:secret"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic !!!".parse().expect("header"));
        assert!(!basic_auth_matches(&headers, "user:secret"));
    }
}
