//! Overlay addresses.
//!
//! Nodes are reachable through an anonymizing transport whose addresses are
//! opaque strings. An address carries host and port parts for display and
//! dialing, but identity is the full string: two addresses are equal exactly
//! when their full strings are equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Address of a node on the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    full: String,
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Create an address from host and port parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            full: format!("{host}:{port}"),
            host,
            port,
        }
    }

    /// Parse an address from its full string form.
    ///
    /// A trailing `:port` is split off when present; otherwise the whole
    /// string is treated as the host and the port is 0.
    pub fn from_full(full: impl Into<String>) -> Self {
        let full = full.into();
        let parsed = full
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host.to_string(), port.parse::<u16>().ok()?)));
        match parsed {
            Some((host, port)) => Self { full, host, port },
            None => Self {
                host: full.clone(),
                port: 0,
                full,
            },
        }
    }

    /// The full address string. This is the node's identity on the overlay.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part, 0 if the address carries none.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_by_full_string() {
        let a = NodeAddress::new("abcd1234.onion", 8333);
        let b = NodeAddress::from_full("abcd1234.onion:8333");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_parse_full_with_port() {
        let addr = NodeAddress::from_full("node7.sim:4007");
        assert_eq!(addr.host(), "node7.sim");
        assert_eq!(addr.port(), 4007);
        assert_eq!(addr.full(), "node7.sim:4007");
    }

    #[test]
    fn test_parse_opaque_without_port() {
        let addr = NodeAddress::from_full("opaque-identifier");
        assert_eq!(addr.host(), "opaque-identifier");
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn test_display_is_full() {
        let addr = NodeAddress::new("x.sim", 1);
        assert_eq!(addr.to_string(), "x.sim:1");
    }
}
