//! Peer identity.
//!
//! A peer is named by the address it listens on. The canonical string form
//! `host:port` is the identity key used in maps, on the wire, and in exported
//! overlay files.

use std::fmt;
use std::str::FromStr;

use crate::TopologyError;

/// The listening address that identifies a peer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerAddress {
    /// Host name or IP literal
    pub host: String,
    /// TCP listening port
    pub port: u16,
}

impl PeerAddress {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The canonical `host:port` identity key.
    pub fn identity_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // rsplit so bracketed IPv6 hosts keep their inner colons
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidAddress(s.to_string()))?;

        if host.is_empty() {
            return Err(TopologyError::InvalidAddress(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| TopologyError::InvalidAddress(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_format() {
        let addr = PeerAddress::new("vertex", 1025);
        assert_eq!(addr.identity_key(), "vertex:1025");
    }

    #[test]
    fn parse_identity_key() {
        let addr: PeerAddress = "10.0.0.7:9000".parse().unwrap();
        assert_eq!(addr.host, "10.0.0.7");
        assert_eq!(addr.port, 9000);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!("localhost".parse::<PeerAddress>().is_err());
        assert!("localhost:".parse::<PeerAddress>().is_err());
        assert!(":9000".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn parse_rejects_port_zero() {
        assert!("localhost:0".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn ordering_is_by_host_then_port() {
        let a = PeerAddress::new("a", 2);
        let b = PeerAddress::new("a", 10);
        let c = PeerAddress::new("b", 1);
        assert!(a < b);
        assert!(b < c);
    }
}
