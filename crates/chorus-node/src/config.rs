//! Process configuration.
//!
//! Both processes read `CHORUS_*` environment variables with defaults, then
//! let positional command-line arguments override them.

use std::str::FromStr;
use std::time::Duration;

use chorus_gossip::{DEFAULT_QUERY_CACHE_SIZE, DEFAULT_SKIP_PROBABILITY};
use chorus_protocols::EngineConfig;
use chorus_topology::PeerAddress;

use crate::error::{NodeError, Result};

/// Registry listening address when none is configured.
pub const DEFAULT_REGISTRY_ADDR: &str = "127.0.0.1:9000";

/// Peers listen on an ephemeral port unless told otherwise.
pub const DEFAULT_PEER_LISTEN_ADDR: &str = "127.0.0.1:0";

/// Gossip table capacity when none is configured.
pub const DEFAULT_CACHE_SIZE: usize = 100;

/// Seconds between anti-entropy rounds.
pub const DEFAULT_GOSSIP_INTERVAL_SECS: u64 = 30;

/// A `host:port` to bind. Port 0 asks for an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for ListenAddr {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || NodeError::Config(format!("invalid listen address: {}", s));
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Configuration for the registry process.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub listen: ListenAddr,
}

impl RegistryConfig {
    /// Create config from environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create config from any variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen = var("CHORUS_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_REGISTRY_ADDR.to_string())
            .parse()?;
        Ok(Self { listen })
    }

    /// Apply `chorus-registry <port>`.
    pub fn with_args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<S> = args.into_iter().collect();
        match args.as_slice() {
            [] => {}
            [port] => self.listen.port = parse_arg("port", port.as_ref())?,
            _ => return Err(NodeError::Config("usage: chorus-registry [port]".into())),
        }
        Ok(self)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr {
                host: "127.0.0.1".into(),
                port: 9000,
            },
        }
    }
}

/// Configuration for a peer process.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub listen: ListenAddr,
    pub registry: PeerAddress,
    /// Devices to front. Zero draws a random count.
    pub device_count: usize,
    /// Capacity of each gossip table.
    pub cache_size: usize,
    /// Capacity of the seen-query log.
    pub query_cache_size: usize,
    pub gossip_interval: Duration,
    /// Chance of dropping a location entry that would evict another.
    pub skip_probability: f64,
}

impl PeerConfig {
    /// Create config from environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create config from any variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen = var("CHORUS_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_PEER_LISTEN_ADDR.to_string())
            .parse()?;

        let registry = var("CHORUS_REGISTRY_ADDR")
            .unwrap_or_else(|| DEFAULT_REGISTRY_ADDR.to_string())
            .parse()
            .map_err(|e| NodeError::Config(format!("CHORUS_REGISTRY_ADDR: {}", e)))?;

        let config = Self {
            listen,
            registry,
            device_count: parse_var(&var, "CHORUS_DEVICE_COUNT", 0)?,
            cache_size: parse_var(&var, "CHORUS_CACHE_SIZE", DEFAULT_CACHE_SIZE)?,
            query_cache_size: parse_var(&var, "CHORUS_QUERY_CACHE_SIZE", DEFAULT_QUERY_CACHE_SIZE)?,
            gossip_interval: Duration::from_secs(parse_var(
                &var,
                "CHORUS_GOSSIP_INTERVAL_SECS",
                DEFAULT_GOSSIP_INTERVAL_SECS,
            )?),
            skip_probability: parse_var(&var, "CHORUS_SKIP_PROBABILITY", DEFAULT_SKIP_PROBABILITY)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `chorus-peer <registry-host> <registry-port> <device-count> <cache-size>`.
    pub fn with_args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<S> = args.into_iter().collect();
        match args.as_slice() {
            [] => {}
            [host, port, devices, cache] => {
                self.registry = PeerAddress::new(host.as_ref(), parse_arg("registry-port", port.as_ref())?);
                self.device_count = parse_arg("device-count", devices.as_ref())?;
                self.cache_size = parse_arg("cache-size", cache.as_ref())?;
            }
            _ => {
                return Err(NodeError::Config(
                    "usage: chorus-peer [<registry-host> <registry-port> <device-count> <cache-size>]"
                        .into(),
                ))
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Engine settings derived from this config.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            query_cache_size: self.query_cache_size,
            table_capacity: self.cache_size,
            skip_probability: self.skip_probability,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.registry.port == 0 {
            return Err(NodeError::Config("registry port must be non-zero".into()));
        }
        // NaN fails the range check
        if !(0.0..=1.0).contains(&self.skip_probability) {
            return Err(NodeError::Config(format!(
                "skip probability {} is outside 0..=1",
                self.skip_probability
            )));
        }
        if self.gossip_interval.is_zero() {
            return Err(NodeError::Config("gossip interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| NodeError::Config(format!("invalid {}: {}", key, raw))),
        None => Ok(default),
    }
}

fn parse_arg<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| NodeError::Config(format!("invalid {}: {}", name, raw)))
}
