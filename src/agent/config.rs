use crate::cni::config::{DenyNetworks, OutboundConnections};
use crate::utils::constants::DEFAULT_POLICY_CHAIN_PREFIX;
use crate::utils::validation::InputValidator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_chain_prefix() -> String {
    DEFAULT_POLICY_CHAIN_PREFIX.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_loopback() -> String {
    "127.0.0.1".to_string()
}

/// Reconciliation agent configuration, loaded from one JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub policy_server_url: String,
    #[serde(default)]
    pub client_cert_file: String,
    #[serde(default)]
    pub client_key_file: String,
    #[serde(default)]
    pub ca_cert_file: String,
    pub client_timeout_seconds: u64,

    /// seconds between C2C reconciliations
    pub poll_interval: u64,
    /// seconds between ASG reconciliations
    pub asg_poll_interval: u64,

    pub datastore: String,
    pub iptables_lock_file: String,
    #[serde(default)]
    pub underlay_ips: Vec<String>,
    #[serde(default)]
    pub temporary_underlay_interface_names: Vec<String>,
    pub overlay_network: String,
    #[serde(default = "default_chain_prefix")]
    pub policy_chain_prefix: String,

    #[serde(default)]
    pub enable_overlay_ingress_rules: bool,
    #[serde(default)]
    pub enable_asg_syncing: bool,
    #[serde(default)]
    pub iptables_c2c_logging: bool,
    #[serde(default)]
    pub iptables_asg_logging: bool,
    pub iptables_denied_logs_per_sec: u32,
    pub iptables_accepted_udp_logs_per_sec: u32,
    #[serde(default)]
    pub deny_networks: DenyNetworks,
    #[serde(default)]
    pub outbound_connections: OutboundConnections,
    #[serde(default)]
    pub overlay_allow_all: bool,

    #[serde(default = "default_loopback")]
    pub force_policy_poll_cycle_host: String,
    pub force_policy_poll_cycle_port: u16,
    #[serde(default = "default_loopback")]
    pub debug_server_host: String,
    pub debug_server_port: u16,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AgentConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: &str| -> ConfigResult<()> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.policy_server_url.is_empty() {
            return invalid("missing policy_server_url");
        }
        if self.client_timeout_seconds < 1 {
            return invalid("client_timeout_seconds must be at least 1");
        }
        if self.poll_interval < 1 {
            return invalid("poll_interval must be at least 1");
        }
        if self.asg_poll_interval < 1 {
            return invalid("asg_poll_interval must be at least 1");
        }
        if self.metrics_interval < 1 {
            return invalid("metrics_interval must be at least 1");
        }
        if self.datastore.is_empty() {
            return invalid("missing datastore");
        }
        if self.iptables_lock_file.is_empty() {
            return invalid("missing iptables_lock_file");
        }
        if self.policy_chain_prefix.is_empty() {
            return invalid("missing policy_chain_prefix");
        }
        if InputValidator::parse_cidr(&self.overlay_network).is_err() {
            return Err(ConfigError::Invalid(format!(
                "invalid overlay_network: {}",
                self.overlay_network
            )));
        }
        if self.iptables_denied_logs_per_sec < 1 || self.iptables_accepted_udp_logs_per_sec < 1 {
            return invalid("log rates must be at least 1");
        }
        let outbound = &self.outbound_connections;
        if outbound.enabled() && (outbound.burst < 1 || outbound.rate_per_sec < 1) {
            return invalid("outbound_connections burst and rate_per_sec must be at least 1");
        }
        // client cert and key come as a pair
        if self.client_cert_file.is_empty() != self.client_key_file.is_empty() {
            return invalid("client_cert_file and client_key_file must be set together");
        }
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_seconds)
    }

    pub fn control_address(&self) -> String {
        format!(
            "{}:{}",
            self.force_policy_poll_cycle_host, self.force_policy_poll_cycle_port
        )
    }

    pub fn debug_address(&self) -> String {
        format!("{}:{}", self.debug_server_host, self.debug_server_port)
    }
}
