//! Request-side device context: client address and user agent.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts, HeaderMap},
};

use crate::{config::ServerConfig, AppState};

pub const UNKNOWN_IP: &str = "unknown";

/// Which peers may speak for the client through forwarding headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingPolicy {
    trust_forwarded_headers: bool,
    trusted_proxies: Vec<IpAddr>,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            trust_forwarded_headers: true,
            trusted_proxies: Vec::new(),
        }
    }
}

impl ForwardingPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            trust_forwarded_headers: config.network.trust_forwarded_headers,
            trusted_proxies: config.trusted_proxies(),
        }
    }

    /// Forwarding headers are ignored entirely, only the socket peer counts.
    pub fn peer_only() -> Self {
        Self {
            trust_forwarded_headers: false,
            trusted_proxies: Vec::new(),
        }
    }

    pub fn with_trusted_proxies(proxies: Vec<IpAddr>) -> Self {
        Self {
            trust_forwarded_headers: true,
            trusted_proxies: proxies,
        }
    }

    fn honors_forwarding(&self, peer: Option<IpAddr>) -> bool {
        if !self.trust_forwarded_headers {
            return false;
        }
        if self.trusted_proxies.is_empty() {
            return true;
        }
        peer.is_some_and(|peer| self.trusted_proxies.contains(&peer))
    }
}

/// Resolve the client address: first `x-forwarded-for` entry, then
/// `x-real-ip`, then the socket peer, else `"unknown"`.
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    policy: &ForwardingPolicy,
) -> String {
    let peer_ip = peer.map(|addr| addr.ip());

    if policy.honors_forwarding(peer_ip) {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(real_ip) = real_ip {
            return real_ip.to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Client address and raw user agent of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

impl FromRequestParts<AppState> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip_address = extract_client_ip(&parts.headers, peer, state.forwarding_policy());
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            ip_address,
            user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().expect("socket addr"))
    }

    #[test]
    fn forwarded_for_wins_and_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 1.2.3.4 , 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(
            extract_client_ip(&headers, peer("10.0.0.1:443"), &ForwardingPolicy::default()),
            "1.2.3.4"
        );
    }

    #[test]
    fn falls_back_to_real_ip_then_peer_then_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        let policy = ForwardingPolicy::default();
        assert_eq!(extract_client_ip(&headers, None, &policy), "9.9.9.9");

        let headers = HeaderMap::new();
        assert_eq!(
            extract_client_ip(&headers, peer("203.0.113.4:5000"), &policy),
            "203.0.113.4"
        );
        assert_eq!(extract_client_ip(&headers, None, &policy), UNKNOWN_IP);
    }

    #[test]
    fn untrusted_peers_cannot_spoof_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let policy = ForwardingPolicy::with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
        assert_eq!(
            extract_client_ip(&headers, peer("198.51.100.7:1234"), &policy),
            "198.51.100.7"
        );
        assert_eq!(
            extract_client_ip(&headers, peer("10.0.0.1:1234"), &policy),
            "1.2.3.4"
        );

        assert_eq!(
            extract_client_ip(&headers, peer("10.0.0.1:1234"), &ForwardingPolicy::peer_only()),
            "10.0.0.1"
        );
    }
}
