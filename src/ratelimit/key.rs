//! Client identity used to key the in-memory limiter.

use std::net::IpAddr;

/// Who a fixed-window counter belongs to.
///
/// An authenticated user always wins over the network address, so users
/// behind a shared NAT do not throttle each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    User(String),
    Address(IpAddr),
    Anonymous,
}

impl ClientKey {
    pub fn new(user_id: Option<&str>, address: Option<IpAddr>) -> Self {
        match (user_id, address) {
            (Some(id), _) => ClientKey::User(id.to_string()),
            (None, Some(ip)) => ClientKey::Address(ip),
            (None, None) => ClientKey::Anonymous,
        }
    }

    /// String form used as the map key, e.g. `user:42` or `ip:10.0.0.1`.
    pub fn to_string_key(&self) -> String {
        match self {
            ClientKey::User(id) => format!("user:{}", id),
            ClientKey::Address(ip) => format!("ip:{}", ip),
            ClientKey::Anonymous => "anonymous".to_string(),
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
