//! Dynamic application security groups.
//!
//! Each container gets its own generation chains under `asg-<h6>`, where
//! `<h6>` is the first six hex characters of SHA-256(handle), linked from its
//! `netout--<handle>` chain. A generation holds the complete egress ruleset so
//! the parent chain can be reduced to a single jump.

use crate::agent::config::AgentConfig;
use crate::agent::error::{AgentError, AgentResult};
use crate::agent::policy_client::SecurityGroup;
use crate::cni::chains::{net_out_default, net_out_preamble, ChainNames};
use crate::cni::config::{DenyNetworks, OutboundConnections};
use crate::datastore::Container;
use crate::iptables::converter::{IcmpInfo, IpRange, NetOutRule, PortRange, Protocol};
use crate::iptables::{ChainNamer, IpTablesRule, RuleConverter};
use crate::utils::constants::{ASG_CHAIN_PREFIX, ASG_HANDLE_HASH_LENGTH};
use crate::utils::validation::InputValidator;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

/// First `ASG_HANDLE_HASH_LENGTH` hex characters of SHA-256(handle)
pub fn handle_hash(handle: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(handle.as_bytes()));
    digest[..ASG_HANDLE_HASH_LENGTH].to_string()
}

/// `asg-<h6>`: both the generation prefix and the managed-chain pattern
pub fn chain_prefix(handle: &str) -> String {
    format!("{}{}", ASG_CHAIN_PREFIX, handle_hash(handle))
}

/// One entry of a security group's `rules` document
#[derive(Debug, Deserialize)]
struct GroupRule {
    protocol: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    ports: String,
    #[serde(rename = "type", default)]
    icmp_type: Option<i32>,
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    log: bool,
}

impl GroupRule {
    fn into_net_out(self) -> Result<NetOutRule, String> {
        let protocol: Protocol = self.protocol.parse()?;
        let networks = InputValidator::parse_ip_ranges(&self.destination)?
            .into_iter()
            .map(|(start, end)| IpRange {
                start: start.to_string(),
                end: end.to_string(),
            })
            .collect();
        let ports = InputValidator::parse_port_ranges(&self.ports)?
            .into_iter()
            .map(|(start, end)| PortRange { start, end })
            .collect();
        let icmp_info = (protocol == Protocol::Icmp).then(|| IcmpInfo {
            icmp_type: self.icmp_type.unwrap_or(-1),
            code: self.code.unwrap_or(-1),
        });

        Ok(NetOutRule {
            protocol,
            networks,
            ports,
            icmp_info,
            log: self.log,
        })
    }
}

/// Decode a group's JSON rule list into converter input
pub fn parse_group_rules(group: &SecurityGroup) -> AgentResult<Vec<NetOutRule>> {
    let invalid = |message: String| AgentError::SecurityGroup {
        group: group.guid.clone(),
        message,
    };

    if group.rules.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<GroupRule> =
        serde_json::from_str(&group.rules).map_err(|e| invalid(e.to_string()))?;
    entries
        .into_iter()
        .map(|entry| entry.into_net_out().map_err(invalid))
        .collect()
}

/// Groups bound to the container's space, or bound globally, for its lifecycle.
/// Staging containers get the staging set; everything else the running set.
/// Ordered by guid.
pub fn groups_for<'a>(groups: &'a [SecurityGroup], container: &Container) -> Vec<&'a SecurityGroup> {
    let space = container.space_id();
    let staging = container.workload() == "staging";

    let mut selected: Vec<&SecurityGroup> = groups
        .iter()
        .filter(|g| {
            let (default, spaces) = if staging {
                (g.staging_default, &g.staging_space_guids)
            } else {
                (g.running_default, &g.running_space_guids)
            };
            default || (!space.is_empty() && spaces.iter().any(|s| s == space))
        })
        .collect();
    selected.sort_by(|a, b| a.guid.cmp(&b.guid));
    selected
}

pub struct AsgPlanner {
    namer: ChainNamer,
    deny_networks: DenyNetworks,
    outbound: OutboundConnections,
    logging: bool,
    denied_logs_per_sec: u32,
}

impl AsgPlanner {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            namer: ChainNamer::default(),
            deny_networks: config.deny_networks.clone(),
            outbound: config.outbound_connections.clone(),
            logging: config.iptables_asg_logging,
            denied_logs_per_sec: config.iptables_denied_logs_per_sec,
        }
    }

    pub fn names(&self, handle: &str) -> AgentResult<ChainNames> {
        ChainNames::new(&self.namer, handle).map_err(|e| AgentError::enforce(handle, e))
    }

    /// Full egress ruleset of one container: connection state, rate limit
    /// and deny networks first, then the group rules, then the default verdict.
    pub fn ruleset(&self, container: &Container, groups: &[SecurityGroup]) -> AgentResult<Vec<IpTablesRule>> {
        let handle = container.handle.as_str();
        let names = self.names(handle)?;

        let mut out = net_out_preamble(
            &names,
            handle,
            &self.outbound,
            &self.deny_networks,
            container.workload(),
        );

        let converter = RuleConverter::new(&names.net_out_log, self.logging);
        for group in groups_for(groups, container) {
            match parse_group_rules(group) {
                Ok(rules) => out.extend(converter.bulk_convert(&rules)),
                Err(e) => warn!(handle, error = %e, "skipping security group"),
            }
        }

        out.extend(net_out_default(handle, self.logging, self.denied_logs_per_sec));
        Ok(out)
    }
}
