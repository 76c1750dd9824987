use crate::iptables::rules::{self, Verdict};
use crate::iptables::IpTablesRule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "all" => Ok(Protocol::All),
            _ => Err(format!("unknown protocol: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IcmpInfo {
    #[serde(rename = "type")]
    pub icmp_type: i32,
    pub code: i32,
}

/// Declarative egress allow rule, as carried in `runtime_config.net_out_rules`
/// and produced from security-group definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetOutRule {
    pub protocol: Protocol,
    #[serde(default)]
    pub networks: Vec<IpRange>,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub icmp_info: Option<IcmpInfo>,
    #[serde(default)]
    pub log: bool,
}

/// Translates `NetOutRule`s into filter rules. Logged rules jump to
/// `log_chain`, which performs the accept after logging.
pub struct RuleConverter {
    log_chain: String,
    global_logging: bool,
}

impl RuleConverter {
    pub fn new(log_chain: &str, global_logging: bool) -> Self {
        Self {
            log_chain: log_chain.to_string(),
            global_logging,
        }
    }

    pub fn convert(&self, rule: &NetOutRule) -> Vec<IpTablesRule> {
        let verdict = if rule.log || self.global_logging {
            Verdict::Log(&self.log_chain)
        } else {
            Verdict::Accept
        };

        match rule.protocol {
            Protocol::Tcp | Protocol::Udp => {
                if rule.ports.is_empty() {
                    tracing::warn!("UDP/TCP rule must specify ports: {:?}", rule);
                    return Vec::new();
                }
                let mut out = Vec::new();
                for network in &rule.networks {
                    for port in &rule.ports {
                        out.push(rules::new_net_out_with_port_rule(
                            &network.start,
                            &network.end,
                            port.start,
                            port.end,
                            rule.protocol.as_str(),
                            verdict,
                        ));
                    }
                }
                out
            }
            Protocol::Icmp => {
                if !rule.ports.is_empty() {
                    tracing::warn!("ICMP rule must not specify ports: {:?}", rule);
                    return Vec::new();
                }
                let Some(icmp) = rule.icmp_info else {
                    tracing::warn!("ICMP rule must specify ICMP type/code: {:?}", rule);
                    return Vec::new();
                };
                rule.networks
                    .iter()
                    .map(|n| {
                        rules::new_net_out_icmp_rule(
                            &n.start,
                            &n.end,
                            icmp.icmp_type,
                            icmp.code,
                            verdict,
                        )
                    })
                    .collect()
            }
            Protocol::All => {
                if !rule.ports.is_empty() {
                    tracing::warn!("Rule for all protocols must not specify ports: {:?}", rule);
                    return Vec::new();
                }
                rule.networks
                    .iter()
                    .map(|n| rules::new_net_out_rule(&n.start, &n.end, verdict))
                    .collect()
            }
        }
    }

    pub fn bulk_convert(&self, rules: &[NetOutRule]) -> Vec<IpTablesRule> {
        rules.iter().flat_map(|r| self.convert(r)).collect()
    }
}
