//! Rate limiting identities and their resolution from request inputs.

use std::net::{IpAddr, SocketAddr};

/// Store key prefix for IP identities.
const IP_PREFIX: &str = "rl:ip:";
/// Store key prefix for token identities.
const TOKEN_PREFIX: &str = "rl:token:";

/// The key an inbound request is rate limited against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateIdentity {
    /// Caller-supplied API token
    Token(String),
    /// Caller network address, port stripped
    IpAddress(String),
}

impl RateIdentity {
    /// Resolve the identity for a request.
    ///
    /// A present, non-empty API key always wins over the origin address.
    pub fn resolve(api_key: Option<&str>, origin: &str) -> Self {
        match api_key {
            Some(token) if !token.is_empty() => RateIdentity::Token(token.to_string()),
            _ => RateIdentity::IpAddress(strip_port(origin).to_string()),
        }
    }

    /// The key this identity's record lives under in the store.
    pub fn store_key(&self) -> String {
        match self {
            RateIdentity::Token(token) => format!("{}{}", TOKEN_PREFIX, token),
            RateIdentity::IpAddress(addr) => format!("{}{}", IP_PREFIX, addr),
        }
    }
}

impl std::fmt::Display for RateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateIdentity::Token(token) => write!(f, "token:{}", token),
            RateIdentity::IpAddress(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// Strip a trailing `:port` from a transport origin address.
///
/// Handles `1.2.3.4:80`, `[::1]:443`, and bare addresses of either family. Only the
/// last colon is ever treated as a port separator, so unbracketed IPv6 literals are
/// returned whole.
pub fn strip_port(origin: &str) -> &str {
    let origin = origin.trim();

    if origin.parse::<IpAddr>().is_ok() {
        return origin;
    }

    if origin.parse::<SocketAddr>().is_ok() {
        if let Some((host, _port)) = origin.rsplit_once(':') {
            return host.trim_start_matches('[').trim_end_matches(']');
        }
    }

    if let Some(inner) = origin.strip_prefix('[') {
        // "[addr]" or "[addr]:port" that did not parse as a socket address
        if let Some(end) = inner.find(']') {
            return &inner[..end];
        }
    }

    match origin.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => origin,
    }
}
