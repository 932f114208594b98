use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use tcprelay_model::Endpoint;

use super::ConfigError;

#[derive(Deserialize, Debug, Clone)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Settings for the relay
    pub relay: RelayConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// The local address to accept clients on
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// The fixed endpoint every client is relayed to
    pub upstream: Endpoint,
    /// How long to wait for the upstream to accept a connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long live connections may keep running once shutdown begins
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
    /// Upper bound on concurrently relayed connections, unlimited if unset
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Backlog passed to `listen(2)`
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
    /// Set `TCP_NODELAY` on both sides of every relayed connection
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_period_ms() -> u64 {
    10_000
}

fn default_listen_backlog() -> u32 {
    1024
}

fn default_nodelay() -> bool {
    true
}

impl RelayConfig {
    /// Defaults for everything but the upstream, as a file with only
    /// `upstream` set would give.
    pub fn with_upstream(upstream: Endpoint) -> Self {
        Self::new(default_listen_address(), upstream)
    }

    pub fn new(listen_address: SocketAddr, upstream: Endpoint) -> Self {
        RelayConfig {
            listen_address,
            upstream,
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            max_connections: None,
            listen_backlog: default_listen_backlog(),
            nodelay: default_nodelay(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be non-zero"));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.listen_backlog == 0 {
            return Err(ConfigError::Invalid("listen_backlog must be non-zero"));
        }

        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()
    }
}
