//! Runtime configuration.
//!
//! A braid instance is either the client end (it listens for upstream
//! connections and dials the downstream links) or the server end (it
//! listens on the downstream links and dials the upstream target). Each
//! downstream address carries the tag of the cover module that dresses its
//! traffic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::steg;

/// Which end of the tunnel this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listen for upstream connections, dial downstream links.
    Client,
    /// Listen on downstream links, dial the upstream target.
    Server,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One downstream link: an address plus the cover module dressing it.
#[derive(Debug, Clone)]
pub struct DownstreamAddr {
    /// Dial address (client) or listen address (server)
    pub addr: String,
    /// Cover module tag, e.g. `nosteg`
    pub steg: String,
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which end of the tunnel this instance is
    pub role: Role,
    /// Upstream listen address (client) or target address (server)
    pub upstream_addr: String,
    /// Downstream links
    pub downstreams: Vec<DownstreamAddr>,
    /// Shared secret for the optional encryption layer; the multiplexer
    /// itself never reads it
    pub secret: Option<Vec<u8>>,
    /// Verbose protocol tracing
    pub trace: bool,
    /// Keep all state in RAM, never touch disk
    pub ram_only: bool,
    /// Disable block retransmission in outer layers (the multiplexer never
    /// retransmits)
    pub disable_retransmit: bool,
    /// How long a circuit survives with no downstream connections before
    /// it is destroyed
    pub axe_timeout: Duration,
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.upstream_addr.is_empty() {
            return Err("upstream_addr cannot be empty".into());
        }
        if self.downstreams.is_empty() {
            return Err("at least one downstream must be configured".into());
        }
        for down in &self.downstreams {
            if down.addr.is_empty() {
                return Err("downstream addr cannot be empty".into());
            }
            if let Err(e) = steg::by_name(&down.steg) {
                return Err(e.to_string());
            }
        }
        if self.axe_timeout.is_zero() {
            return Err("axe_timeout_ms must be positive".into());
        }
        Ok(())
    }
}

fn default_steg() -> String {
    "nosteg".into()
}

fn default_axe_timeout_ms() -> u64 {
    100
}

fn default_ram_only() -> bool {
    true
}

/// One downstream entry in the configuration file.
#[derive(Debug, Serialize, Deserialize)]
pub struct DownstreamEntry {
    /// Dial address (client) or listen address (server)
    pub addr: String,
    /// Cover module tag
    #[serde(default = "default_steg")]
    pub steg: String,
}

/// Configuration file format (toml).
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// `client` or `server`
    pub role: String,
    /// Upstream listen address (client) or target address (server)
    pub upstream: String,
    /// Downstream links
    pub downstream: Vec<DownstreamEntry>,
    /// Shared secret (hex) for the optional encryption layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hex: Option<String>,
    /// Verbose protocol tracing
    #[serde(default)]
    pub trace: bool,
    /// Keep all state in RAM
    #[serde(default = "default_ram_only")]
    pub ram_only: bool,
    /// Disable retransmission in outer layers
    #[serde(default)]
    pub disable_retransmit: bool,
    /// Circuit grace period after losing its last connection (milliseconds)
    #[serde(default = "default_axe_timeout_ms")]
    pub axe_timeout_ms: u64,
}

impl ConfigFile {
    /// Convert to the runtime configuration.
    pub fn to_config(&self) -> Result<Config, String> {
        let role: Role = self.role.parse()?;

        let secret = match &self.secret_hex {
            Some(hex_secret) => Some(
                hex::decode(hex_secret).map_err(|e| format!("invalid hex secret: {e}"))?,
            ),
            None => None,
        };

        let config = Config {
            role,
            upstream_addr: self.upstream.clone(),
            downstreams: self
                .downstream
                .iter()
                .map(|entry| DownstreamAddr {
                    addr: entry.addr.clone(),
                    steg: entry.steg.clone(),
                })
                .collect(),
            secret,
            trace: self.trace,
            ram_only: self.ram_only,
            disable_retransmit: self.disable_retransmit,
            axe_timeout: Duration::from_millis(self.axe_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from a runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            role: match config.role {
                Role::Client => "client".into(),
                Role::Server => "server".into(),
            },
            upstream: config.upstream_addr.clone(),
            downstream: config
                .downstreams
                .iter()
                .map(|down| DownstreamEntry {
                    addr: down.addr.clone(),
                    steg: down.steg.clone(),
                })
                .collect(),
            secret_hex: config.secret.as_ref().map(hex::encode),
            trace: config.trace,
            ram_only: config.ram_only,
            disable_retransmit: config.disable_retransmit,
            axe_timeout_ms: config.axe_timeout.as_millis() as u64,
        }
    }

    /// A starting-point client configuration for `--generate`.
    pub fn example() -> Self {
        Self {
            role: "client".into(),
            upstream: "127.0.0.1:1080".into(),
            downstream: vec![
                DownstreamEntry {
                    addr: "198.51.100.7:443".into(),
                    steg: default_steg(),
                },
                DownstreamEntry {
                    addr: "198.51.100.8:443".into(),
                    steg: default_steg(),
                },
            ],
            secret_hex: None,
            trace: false,
            ram_only: true,
            disable_retransmit: false,
            axe_timeout_ms: default_axe_timeout_ms(),
        }
    }
}
