use crate::cni::error::{PluginError, PluginResult};
use crate::datastore::Metadata;
use crate::iptables::NetOutRule;
use crate::utils::constants::DEFAULT_CNI_VERSION;
use crate::utils::validation::InputValidator;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub net_out_rules: Vec<NetOutRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DenyNetworks {
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(default)]
    pub running: Vec<String>,
    #[serde(default)]
    pub staging: Vec<String>,
}

impl DenyNetworks {
    /// CIDRs to reject for a container of the given workload
    pub fn for_workload(&self, workload: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self.always.iter().map(String::as_str).collect();
        match workload {
            "app" | "task" => out.extend(self.running.iter().map(String::as_str)),
            "staging" => out.extend(self.staging.iter().map(String::as_str)),
            _ => {}
        }
        out
    }

    fn validate(&self) -> Result<(), String> {
        for cidr in self.always.iter().chain(&self.running).chain(&self.staging) {
            InputValidator::parse_cidr(cidr).map_err(|e| format!("invalid deny network: {}", e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundConnections {
    #[serde(default)]
    pub limit: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub rate_per_sec: u32,
    #[serde(default)]
    pub dry_run: bool,
}

impl OutboundConnections {
    /// The rate-limit rule is installed at all
    pub fn enabled(&self) -> bool {
        self.limit || self.dry_run
    }

    /// Over-limit connections go through the rate-limit log chain
    pub fn logs(&self) -> bool {
        (self.limit && self.logging) || self.dry_run
    }
}

/// Wrapper configuration read from stdin on every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperConfig {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    pub datastore: String,
    #[serde(default)]
    pub datastore_file_owner: String,
    #[serde(default)]
    pub datastore_file_group: String,
    pub iptables_lock_file: String,

    /// Upstream IP plugin configuration, passed through untouched
    pub delegate: serde_json::Map<String, Value>,

    pub instance_address: String,
    pub no_masquerade_cidr_range: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub host_tcp_services: Vec<String>,
    #[serde(default)]
    pub host_udp_services: Vec<String>,
    #[serde(default)]
    pub deny_networks: DenyNetworks,
    #[serde(default)]
    pub underlay_ips: Vec<String>,
    #[serde(default)]
    pub temporary_underlay_interface_names: Vec<String>,

    #[serde(default)]
    pub iptables_asg_logging: bool,
    #[serde(default)]
    pub iptables_c2c_logging: bool,
    pub iptables_denied_logs_per_sec: u32,
    pub iptables_accepted_udp_logs_per_sec: u32,

    pub ingress_tag: String,
    pub vtep_name: String,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    pub policy_agent_force_poll_address: String,
    #[serde(default)]
    pub outbound_connections: OutboundConnections,
    #[serde(default)]
    pub metadata: Metadata,
}

impl WrapperConfig {
    /// Decode stdin and default the delegate's `cniVersion` from ours.
    pub fn parse(stdin: &[u8]) -> PluginResult<Self> {
        let mut config: WrapperConfig =
            serde_json::from_slice(stdin).map_err(|e| PluginError::Decode(e.to_string()))?;

        if config.cni_version.is_empty() {
            config.cni_version = DEFAULT_CNI_VERSION.to_string();
        }
        if !config.delegate.contains_key("cniVersion") {
            config.delegate.insert(
                "cniVersion".to_string(),
                Value::String(config.cni_version.clone()),
            );
        }
        Ok(config)
    }

    pub fn delegate_bytes(&self) -> PluginResult<Vec<u8>> {
        serde_json::to_vec(&self.delegate).map_err(|e| PluginError::Delegate(e.to_string()))
    }

    /// Checks run before any side effect.
    pub fn validate(&self) -> PluginResult<()> {
        let invalid = |msg: String| -> PluginResult<()> { Err(PluginError::InvalidConfig(msg)) };

        if self.datastore.is_empty() {
            return invalid("missing datastore path".to_string());
        }
        if self.iptables_lock_file.is_empty() {
            return invalid("missing iptables lock file".to_string());
        }
        if self.vtep_name.is_empty() {
            return invalid("missing vtep name".to_string());
        }
        if self.policy_agent_force_poll_address.is_empty() {
            return invalid("missing policy agent force poll address".to_string());
        }
        if self.ingress_tag.is_empty() || u32::from_str_radix(&self.ingress_tag, 16).is_err() {
            return invalid(format!("invalid ingress tag: {}", self.ingress_tag));
        }
        if let Err(e) = InputValidator::parse_cidr(&self.no_masquerade_cidr_range) {
            return invalid(format!("invalid no masquerade cidr range: {}", e));
        }
        if self.iptables_denied_logs_per_sec < 1 {
            return invalid("invalid denied logs per sec".to_string());
        }
        if self.iptables_accepted_udp_logs_per_sec < 1 {
            return invalid("invalid accepted udp logs per sec".to_string());
        }

        let outbound = &self.outbound_connections;
        if outbound.enabled() {
            if outbound.burst < 1 {
                return invalid("invalid outbound connection burst".to_string());
            }
            if outbound.rate_per_sec < 1 {
                return invalid("invalid outbound connection rate".to_string());
            }
        }

        if let Err(e) = self.deny_networks.validate() {
            return invalid(e);
        }
        for service in self.host_tcp_services.iter().chain(&self.host_udp_services) {
            if let Err(e) = InputValidator::parse_host_port(service) {
                return invalid(format!("invalid host service: {}", e));
            }
        }

        let mappings = &self.runtime_config.port_mappings;
        if mappings.iter().any(|m| m.host_port == 0) {
            return invalid("cannot allocate port 0".to_string());
        }
        if !mappings.is_empty() && InputValidator::parse_ip(&self.instance_address).is_err() {
            return Err(PluginError::NetIn(format!(
                "invalid ip: {}",
                self.instance_address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_json() -> Value {
        json!({
            "cniVersion": "0.3.1",
            "name": "cni-wrapper",
            "type": "netwarden-cni",
            "datastore": "/tmp/store.json",
            "iptables_lock_file": "/tmp/iptables.lock",
            "delegate": {"type": "silk", "name": "silk"},
            "instance_address": "10.244.2.3",
            "no_masquerade_cidr_range": "10.255.0.0/16",
            "dns_servers": ["169.254.0.2", "8.8.8.8"],
            "host_tcp_services": ["169.254.0.2:9001"],
            "host_udp_services": ["169.254.0.2:53"],
            "underlay_ips": ["10.0.0.1"],
            "iptables_denied_logs_per_sec": 2,
            "iptables_accepted_udp_logs_per_sec": 3,
            "ingress_tag": "FFFF0000",
            "vtep_name": "some-device",
            "policy_agent_force_poll_address": "127.0.0.1:22222",
            "runtime_config": {
                "port_mappings": [
                    {"host_port": 1000, "container_port": 1001},
                    {"host_port": 2000, "container_port": 2001}
                ]
            }
        })
    }

    fn parse(value: Value) -> PluginResult<WrapperConfig> {
        WrapperConfig::parse(value.to_string().as_bytes())
    }

    #[test]
    fn test_parse_defaults_delegate_version() {
        let config = parse(sample_json()).unwrap();
        assert_eq!(config.delegate["cniVersion"], json!("0.3.1"));
        assert!(config.validate().is_ok());

        let mut value = sample_json();
        value["delegate"]["cniVersion"] = json!("0.4.0");
        let config = parse(value).unwrap();
        assert_eq!(config.delegate["cniVersion"], json!("0.4.0"));
    }

    #[test]
    fn test_missing_required_key_fails_to_decode() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("vtep_name");
        let err = parse(value).unwrap_err();
        assert!(err.to_string().starts_with("loading config: "), "{}", err);
    }

    #[test]
    fn test_port_zero_is_rejected() {
        let mut value = sample_json();
        value["runtime_config"]["port_mappings"] = json!([{"host_port": 0, "container_port": 1001}]);
        let err = parse(value).unwrap().validate().unwrap_err();
        assert_eq!(err.to_string(), "cannot allocate port 0");
    }

    #[test]
    fn test_invalid_instance_address() {
        let mut value = sample_json();
        value["instance_address"] = json!("not-an-ip");
        let err = parse(value).unwrap().validate().unwrap_err();
        assert_eq!(err.to_string(), "adding netin rule: invalid ip: not-an-ip");
    }

    #[test]
    fn test_rate_limits_must_be_positive() {
        let mut value = sample_json();
        value["iptables_denied_logs_per_sec"] = json!(0);
        assert!(parse(value).unwrap().validate().is_err());

        let mut value = sample_json();
        value["outbound_connections"] = json!({"limit": true, "burst": 0, "rate_per_sec": 1});
        assert!(parse(value).unwrap().validate().is_err());
    }

    #[test]
    fn test_deny_networks_by_workload() {
        let deny = DenyNetworks {
            always: vec!["1.0.0.0/8".to_string()],
            running: vec!["2.0.0.0/8".to_string()],
            staging: vec!["3.0.0.0/8".to_string()],
        };
        assert_eq!(deny.for_workload("app"), vec!["1.0.0.0/8", "2.0.0.0/8"]);
        assert_eq!(deny.for_workload("task"), vec!["1.0.0.0/8", "2.0.0.0/8"]);
        assert_eq!(deny.for_workload("staging"), vec!["1.0.0.0/8", "3.0.0.0/8"]);
        assert_eq!(deny.for_workload(""), vec!["1.0.0.0/8"]);
    }

    #[test]
    fn test_outbound_modes() {
        let dry = OutboundConnections {
            dry_run: true,
            ..Default::default()
        };
        assert!(dry.enabled() && dry.logs());
        let silent = OutboundConnections {
            limit: true,
            ..Default::default()
        };
        assert!(silent.enabled() && !silent.logs());
    }
}
