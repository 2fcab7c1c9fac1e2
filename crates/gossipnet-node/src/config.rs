//! Configuration types for gossipnet-node.
//! Parsed from a TOML file; every section is optional.

use gossipnet_protocol::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Port assumed for a seed node given without one.
pub const DEFAULT_PORT: u16 = 10000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timers: TimersSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_net_id")]
    pub net_id: u8,
    /// Fixed identity. A random one is generated at startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            net_id: default_net_id(),
            peer_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub seed_nodes: Vec<SeedNode>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: default_port(),
            seed_nodes: Vec::new(),
        }
    }
}

impl NetworkSection {
    /// Add a seed node unless an identical host:port is already listed.
    pub fn add_seed_node(&mut self, host: impl Into<String>, port: u16) -> bool {
        let host = host.into();
        tracing::info!(%host, port, "adding seed node");
        if self.has_seed_node(&host, port) {
            return false;
        }
        self.seed_nodes.push(SeedNode { host, port });
        true
    }

    pub fn has_seed_node(&self, host: &str, port: u16) -> bool {
        self.seed_nodes
            .iter()
            .any(|s| s.host == host && s.port == port)
    }
}

/// A bootstrap target known by address only; its identity is learned in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub host: String,
    pub port: u16,
}

impl SeedNode {
    /// Parse a `;`-separated list such as `"127.0.0.1:20000;10.0.0.2"`.
    pub fn parse_list(s: &str) -> Result<Vec<SeedNode>, SeedNodeParseError> {
        s.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for SeedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid seed node {input:?}: {reason}")]
pub struct SeedNodeParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for SeedNode {
    type Err = SeedNodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| SeedNodeParseError {
            input: s.to_string(),
            reason,
        };

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| err("port is not a number"))?,
            ),
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(err("empty host"));
        }
        if port == 0 {
            return Err(err("port 0"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_10")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_3")]
    pub failures_before_ban: u32,
    #[serde(default = "default_600")]
    pub ban_duration_secs: u64,
    #[serde(default = "default_64")]
    pub max_shared_peers: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            failures_before_ban: 3,
            ban_duration_secs: 600,
            max_shared_peers: 64,
        }
    }
}

impl LimitsSection {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

/// Cadence of the maintenance tasks driven by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersSection {
    #[serde(default = "default_10")]
    pub connect_seeds_secs: u64,
    #[serde(default = "default_30")]
    pub exchange_peers_secs: u64,
    #[serde(default = "default_5")]
    pub ping_secs: u64,
}

impl Default for TimersSection {
    fn default() -> Self {
        Self {
            connect_seeds_secs: 10,
            exchange_peers_secs: 30,
            ping_secs: 5,
        }
    }
}

// Default value functions
fn default_net_id() -> u8 {
    1
}
fn default_listen_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_3() -> u32 {
    3
}
fn default_5() -> u64 {
    5
}
fn default_10() -> u64 {
    10
}
fn default_30() -> u64 {
    30
}
fn default_64() -> usize {
    64
}
fn default_600() -> u64 {
    600
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    /// Parse a TOML document. Repeated seed entries are collapsed.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: NodeConfig = toml::from_str(content)?;
        let seeds = std::mem::take(&mut config.network.seed_nodes);
        for seed in seeds {
            config.network.add_seed_node(seed.host, seed.port);
        }
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(Self::parse(&content)?)
        } else {
            Ok(Self::default())
        }
    }
}
