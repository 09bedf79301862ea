//! Rate limit key derivation.
//!
//! Keys are opaque strings in two namespaces, `ip:` and `user:`, so an
//! address and a user name can never collide in a store.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header carrying the client address as seen by a single proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Authenticated identity placed in request extensions by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedUser(pub String);

/// How a request is mapped to a rate limit key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Client IP address
    #[default]
    Ip,
    /// Authenticated user, falling back to client IP for anonymous requests
    User,
}

impl KeyStrategy {
    /// Derive the key for a request.
    pub fn derive(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<&str>,
        user: Option<&AuthenticatedUser>,
    ) -> String {
        match (self, user) {
            (KeyStrategy::User, Some(user)) if !user.0.trim().is_empty() => user_key(user),
            _ => ip_key(headers, remote_addr),
        }
    }
}

/// Key for the client address of a request.
pub fn ip_key(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    format!("ip:{}", client_ip(headers, remote_addr))
}

/// Key for an authenticated user.
pub fn user_key(user: &AuthenticatedUser) -> String {
    format!("user:{}", user.0.trim())
}

/// Resolve the client address of a request.
///
/// Prefers the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// transport address with its port removed. Returns `"unknown"` when none
/// is available.
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    let forwarded = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = header_str(headers, REAL_IP_HEADER)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return ip.to_string();
    }

    remote_addr
        .map(|addr| strip_port(addr.trim()))
        .filter(|addr| !addr.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Remove the port from `host:port` or `[v6]:port`.
///
/// A bare IPv6 address (more than one colon, no brackets) is returned as is.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => addr,
        };
    }

    match addr.rfind(':') {
        Some(idx) if addr[..idx].find(':').is_none() => &addr[..idx],
        _ => addr,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&map, Some("127.0.0.1:5000")), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_used_when_no_forwarded_for() {
        let map = headers(&[("x-real-ip", "  198.51.100.2 ")]);
        assert_eq!(client_ip(&map, Some("127.0.0.1:5000")), "198.51.100.2");
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let map = headers(&[("x-forwarded-for", " , 10.0.0.1")]);
        assert_eq!(client_ip(&map, Some("192.0.2.9:443")), "192.0.2.9");
    }

    #[test]
    fn test_remote_addr_port_stripped() {
        let map = HeaderMap::new();
        assert_eq!(client_ip(&map, Some("192.0.2.9:443")), "192.0.2.9");
        assert_eq!(client_ip(&map, Some("[2001:db8::1]:8080")), "2001:db8::1");
        assert_eq!(client_ip(&map, None), "unknown");
    }

    #[test]
    fn test_strip_port_variants() {
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(strip_port("[::1]:80"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_user_and_ip_namespaces_differ() {
        let map = HeaderMap::new();
        let user = AuthenticatedUser("10.0.0.1".to_string());

        let user_based = KeyStrategy::User.derive(&map, Some("10.0.0.1:1"), Some(&user));
        let ip_based = KeyStrategy::Ip.derive(&map, Some("10.0.0.1:1"), Some(&user));

        assert_eq!(user_based, "user:10.0.0.1");
        assert_eq!(ip_based, "ip:10.0.0.1");
    }

    #[test]
    fn test_user_strategy_falls_back_to_ip() {
        let map = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(KeyStrategy::User.derive(&map, None, None), "ip:198.51.100.2");
    }
}
