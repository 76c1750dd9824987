//! The per-container filter fabric: which chains exist, what they contain,
//! and how they are linked into the built-in chains.

use crate::cni::config::{DenyNetworks, OutboundConnections, WrapperConfig};
use crate::iptables::rules;
use crate::iptables::{
    jump_rules_to, ChainNamer, IpTables, IpTablesError, IpTablesResult, IpTablesRule,
    RuleConverter, FILTER, MANGLE, NAT,
};
use crate::utils::constants::{
    INPUT_CHAIN_PREFIX, LOG_CHAIN_SUFFIX, NETIN_CHAIN_PREFIX, NETOUT_CHAIN_PREFIX,
    OVERLAY_CHAIN_PREFIX, RATE_LIMIT_LOG_CHAIN_SUFFIX,
};
use crate::utils::validation::InputValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpPosition {
    /// after any existing rule in the parent
    Append,
    /// ahead of every existing rule in the parent
    Insert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub table: &'static str,
    /// None for free-standing chains
    pub parent_chain: Option<&'static str>,
    pub name: String,
    pub jump_conditions: Vec<IpTablesRule>,
    pub jump_position: JumpPosition,
    pub rules: Vec<IpTablesRule>,
}

impl ChainSpec {
    /// Create, fill and link the chain as one locked unit
    pub fn install(&self, ipt: &dyn IpTables) -> IpTablesResult<()> {
        ipt.new_chain(self.table, &self.name)?;
        ipt.bulk_append(self.table, &self.name, &self.rules)?;
        if let Some(parent) = self.parent_chain {
            match self.jump_position {
                JumpPosition::Append => {
                    ipt.bulk_append(self.table, parent, &self.jump_conditions)?
                }
                JumpPosition::Insert => {
                    ipt.bulk_insert(self.table, parent, 1, &self.jump_conditions)?
                }
            }
        }
        Ok(())
    }
}

/// Names of the chains derived from one container handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNames {
    pub input: String,
    pub net_out: String,
    pub net_out_log: String,
    pub rate_limit_log: String,
    pub overlay: String,
    pub net_in: String,
}

impl ChainNames {
    pub fn new(namer: &ChainNamer, handle: &str) -> IpTablesResult<Self> {
        let net_out = namer.prefix(NETOUT_CHAIN_PREFIX, handle);
        Ok(Self {
            input: namer.prefix(INPUT_CHAIN_PREFIX, handle),
            net_out_log: namer.postfix(&net_out, LOG_CHAIN_SUFFIX)?,
            rate_limit_log: namer.postfix(&net_out, RATE_LIMIT_LOG_CHAIN_SUFFIX)?,
            overlay: namer.prefix(OVERLAY_CHAIN_PREFIX, handle),
            net_in: namer.prefix(NETIN_CHAIN_PREFIX, handle),
            net_out,
        })
    }

    /// (table, parent, chain) in teardown order: every chain is unreferenced
    /// by the time it is deleted.
    pub fn teardown_order(&self) -> Vec<(&'static str, Option<&'static str>, &str)> {
        vec![
            (NAT, Some("PREROUTING"), self.net_in.as_str()),
            (MANGLE, Some("PREROUTING"), self.net_in.as_str()),
            (FILTER, Some("FORWARD"), self.overlay.as_str()),
            (FILTER, Some("FORWARD"), self.net_out.as_str()),
            (FILTER, None, self.net_out_log.as_str()),
            (FILTER, None, self.rate_limit_log.as_str()),
            (FILTER, Some("INPUT"), self.input.as_str()),
        ]
    }
}

/// Rules of `netout--<handle>` up to (not including) the allow rules:
/// connection state, the outbound rate limit and the deny networks.
pub fn net_out_preamble(
    names: &ChainNames,
    handle: &str,
    outbound: &OutboundConnections,
    deny_networks: &DenyNetworks,
    workload: &str,
) -> Vec<IpTablesRule> {
    let mut chain_rules = vec![
        rules::new_net_out_related_established_rule(),
        rules::new_net_out_invalid_rule(),
    ];

    if outbound.enabled() {
        let target = if outbound.logs() {
            names.rate_limit_log.as_str()
        } else {
            "REJECT"
        };
        chain_rules.push(rules::new_net_out_conn_rate_limit_rule(
            outbound.rate_per_sec,
            outbound.burst,
            handle,
            target,
        ));
    }

    for cidr in deny_networks.for_workload(workload) {
        chain_rules.push(rules::new_reject_network_rule(cidr));
    }
    chain_rules
}

/// Terminal verdict of `netout--<handle>`, logged first when asked
pub fn net_out_default(handle: &str, logging: bool, denied_logs_per_sec: u32) -> Vec<IpTablesRule> {
    let mut chain_rules = Vec::new();
    if logging {
        chain_rules.push(rules::new_log_rule(&[], "DENY", handle, denied_logs_per_sec));
    }
    chain_rules.push(rules::new_net_out_default_reject_rule());
    chain_rules
}

/// Builds every chain for one container from the wrapper configuration.
pub struct Fabric<'a> {
    config: &'a WrapperConfig,
    handle: &'a str,
    container_ip: &'a str,
    underlays: &'a [String],
    names: ChainNames,
}

impl<'a> Fabric<'a> {
    pub fn new(
        config: &'a WrapperConfig,
        namer: &ChainNamer,
        handle: &'a str,
        container_ip: &'a str,
        underlays: &'a [String],
    ) -> IpTablesResult<Self> {
        Ok(Self {
            config,
            handle,
            container_ip,
            underlays,
            names: ChainNames::new(namer, handle)?,
        })
    }

    pub fn names(&self) -> &ChainNames {
        &self.names
    }

    fn workload(&self) -> &str {
        self.config
            .metadata
            .get("container_workload")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Chains in install order; jump targets always exist before their referrers.
    pub fn chains(&self) -> IpTablesResult<Vec<ChainSpec>> {
        let mut chains = vec![self.input_chain()?, self.net_out_log_chain()];
        if self.config.outbound_connections.logs() {
            chains.push(self.rate_limit_log_chain());
        }
        chains.push(self.net_out_chain());
        chains.push(self.overlay_chain());
        chains.push(self.net_in_nat_chain());
        chains.push(self.net_in_mangle_chain());
        Ok(chains)
    }

    pub fn input_chain(&self) -> IpTablesResult<ChainSpec> {
        let mut chain_rules = vec![rules::new_input_related_established_rule()];

        for dns in &self.config.dns_servers {
            if InputValidator::is_link_local(dns) {
                chain_rules.push(rules::new_input_allow_rule("tcp", dns, 53));
                chain_rules.push(rules::new_input_allow_rule("udp", dns, 53));
            }
        }
        for (protocol, services) in [
            ("tcp", &self.config.host_tcp_services),
            ("udp", &self.config.host_udp_services),
        ] {
            for service in services {
                let (host, port) = InputValidator::parse_host_port(service)
                    .map_err(IpTablesError::Rule)?;
                chain_rules.push(rules::new_input_allow_rule(protocol, &host.to_string(), port));
            }
        }
        chain_rules.push(rules::new_input_default_reject_rule());

        Ok(ChainSpec {
            table: FILTER,
            parent_chain: Some("INPUT"),
            name: self.names.input.clone(),
            jump_conditions: vec![rules::new_source_jump_rule(
                self.container_ip,
                &self.names.input,
            )],
            jump_position: JumpPosition::Append,
            rules: chain_rules,
        })
    }

    fn net_out_preamble(&self) -> Vec<IpTablesRule> {
        net_out_preamble(
            &self.names,
            self.handle,
            &self.config.outbound_connections,
            &self.config.deny_networks,
            self.workload(),
        )
    }

    /// 1-based position at which per-app egress rules go
    pub fn app_rules_position(&self) -> usize {
        self.net_out_preamble().len() + 1
    }

    /// Per-app `net_out_rules`, converted
    pub fn app_rules(&self) -> Vec<IpTablesRule> {
        RuleConverter::new(&self.names.net_out_log, self.config.iptables_asg_logging)
            .bulk_convert(&self.config.runtime_config.net_out_rules)
    }

    pub fn net_out_chain(&self) -> ChainSpec {
        let mut chain_rules = self.net_out_preamble();
        chain_rules.extend(net_out_default(
            self.handle,
            self.config.iptables_asg_logging,
            self.config.iptables_denied_logs_per_sec,
        ));

        ChainSpec {
            table: FILTER,
            parent_chain: Some("FORWARD"),
            name: self.names.net_out.clone(),
            jump_conditions: self
                .underlays
                .iter()
                .map(|underlay| {
                    rules::new_net_out_jump_condition_rule(
                        underlay,
                        self.container_ip,
                        &self.names.net_out,
                    )
                })
                .collect(),
            jump_position: JumpPosition::Insert,
            rules: chain_rules,
        }
    }

    pub fn net_out_log_chain(&self) -> ChainSpec {
        ChainSpec {
            table: FILTER,
            parent_chain: None,
            name: self.names.net_out_log.clone(),
            jump_conditions: Vec::new(),
            jump_position: JumpPosition::Append,
            rules: vec![
                rules::new_net_out_default_non_udp_log_rule(self.handle),
                rules::new_net_out_default_udp_log_rule(
                    self.handle,
                    self.config.iptables_accepted_udp_logs_per_sec,
                ),
                rules::new_accept_rule(),
            ],
        }
    }

    pub fn rate_limit_log_chain(&self) -> ChainSpec {
        let mut chain_rules = vec![rules::new_log_rule(
            &[],
            "DENY_ORL",
            self.handle,
            self.config.iptables_denied_logs_per_sec,
        )];
        if !self.config.outbound_connections.dry_run {
            chain_rules.push(rules::new_net_out_default_reject_rule());
        }
        ChainSpec {
            table: FILTER,
            parent_chain: None,
            name: self.names.rate_limit_log.clone(),
            jump_conditions: Vec::new(),
            jump_position: JumpPosition::Append,
            rules: chain_rules,
        }
    }

    pub fn overlay_chain(&self) -> ChainSpec {
        let ip = self.container_ip;
        let mut chain_rules = vec![
            rules::new_overlay_allow_egress_rule(ip, &self.config.vtep_name),
            rules::new_overlay_related_established_rule(ip),
            rules::new_overlay_tag_accept_rule(ip, &self.config.ingress_tag),
        ];
        if self.config.iptables_c2c_logging {
            chain_rules.push(rules::new_overlay_default_reject_log_rule(
                ip,
                self.handle,
                self.config.iptables_denied_logs_per_sec,
            ));
        }
        chain_rules.push(rules::new_overlay_default_reject_rule(ip));

        ChainSpec {
            table: FILTER,
            parent_chain: Some("FORWARD"),
            name: self.names.overlay.clone(),
            jump_conditions: vec![rules::new_jump_rule(&self.names.overlay)],
            jump_position: JumpPosition::Insert,
            rules: chain_rules,
        }
    }

    pub fn net_in_nat_chain(&self) -> ChainSpec {
        ChainSpec {
            table: NAT,
            parent_chain: Some("PREROUTING"),
            name: self.names.net_in.clone(),
            jump_conditions: vec![rules::new_jump_rule(&self.names.net_in)],
            jump_position: JumpPosition::Insert,
            rules: self
                .config
                .runtime_config
                .port_mappings
                .iter()
                .map(|m| {
                    rules::new_port_forwarding_rule(
                        m.host_port,
                        m.container_port,
                        &self.config.instance_address,
                        self.container_ip,
                    )
                })
                .collect(),
        }
    }

    pub fn net_in_mangle_chain(&self) -> ChainSpec {
        let mut chain_rules = Vec::new();
        for mapping in &self.config.runtime_config.port_mappings {
            for underlay in self.underlays {
                chain_rules.push(rules::new_ingress_mark_rule(
                    underlay,
                    mapping.host_port,
                    &self.config.instance_address,
                    &self.config.ingress_tag,
                ));
            }
        }
        ChainSpec {
            table: MANGLE,
            parent_chain: Some("PREROUTING"),
            name: self.names.net_in.clone(),
            jump_conditions: vec![rules::new_jump_rule(&self.names.net_in)],
            jump_position: JumpPosition::Insert,
            rules: chain_rules,
        }
    }
}

pub fn masquerade_rule(config: &WrapperConfig, container_ip: &str) -> IpTablesRule {
    rules::new_default_egress_rule(
        container_ip,
        &config.vtep_name,
        Some(config.no_masquerade_cidr_range.as_str()),
    )
}

/// Unlink, flush and delete one chain. Jump rules are discovered from the
/// parent's listing so this works without knowing the container IP.
/// A chain that does not exist is not an error.
pub fn remove_chain(
    ipt: &dyn IpTables,
    table: &str,
    parent_chain: Option<&str>,
    chain: &str,
) -> IpTablesResult<()> {
    if !ipt.list_chains(table)?.iter().any(|c| c == chain) {
        return Ok(());
    }
    if let Some(parent) = parent_chain {
        for jump in jump_rules_to(ipt, table, parent, chain)? {
            ipt.delete(table, parent, &jump)?;
        }
    }
    ipt.clear_chain(table, chain)?;
    ipt.delete_chain(table, chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::config::tests::sample_json;
    use crate::iptables::memory::InMemoryIpTables;
    use serde_json::json;

    const HANDLE: &str = "some-container-id-that-is-long";

    fn config(patch: impl FnOnce(&mut serde_json::Value)) -> WrapperConfig {
        let mut value = sample_json();
        patch(&mut value);
        WrapperConfig::parse(value.to_string().as_bytes()).unwrap()
    }

    fn underlays() -> Vec<String> {
        vec!["underlay1".to_string(), "underlay2".to_string()]
    }

    #[test]
    fn test_chain_names() {
        let names = ChainNames::new(&ChainNamer::default(), HANDLE).unwrap();
        assert_eq!(names.net_out, "netout--some-container-id-th");
        assert_eq!(names.net_out_log, "netout--some-container---log");
        assert!(names.rate_limit_log.ends_with("--rl-log"));
        assert_eq!(names.net_in, "netin--some-container-id-tha");
        assert_eq!(names.input, "input--some-container-id-tha");
    }

    #[test]
    fn test_input_chain_allows_link_local_dns_and_host_services() {
        let config = config(|_| {});
        let u = underlays();
        let fabric = Fabric::new(&config, &ChainNamer::default(), HANDLE, "1.2.3.4", &u).unwrap();
        let input = fabric.input_chain().unwrap();
        let text: Vec<String> = input.rules.iter().map(|r| r.to_string()).collect();

        assert_eq!(text[0], "-m state --state RELATED,ESTABLISHED -j ACCEPT");
        assert!(text.contains(&"-p tcp -d 169.254.0.2/32 -m tcp --dport 53 -j ACCEPT".to_string()));
        assert!(text.contains(&"-p udp -d 169.254.0.2/32 -m udp --dport 53 -j ACCEPT".to_string()));
        // not link-local
        assert!(!text.iter().any(|t| t.contains("8.8.8.8")));
        assert!(text.contains(&"-p tcp -d 169.254.0.2/32 -m tcp --dport 9001 -j ACCEPT".to_string()));
        assert_eq!(
            text.last().unwrap(),
            "-j REJECT --reject-with icmp-port-unreachable"
        );
        assert_eq!(input.jump_position, JumpPosition::Append);
        assert_eq!(
            input.jump_conditions[0].to_string(),
            "-s 1.2.3.4/32 -j input--some-container-id-tha"
        );
    }

    #[test]
    fn test_net_out_chain_ordering() {
        let config = config(|v| {
            v["iptables_asg_logging"] = json!(true);
            v["deny_networks"] = json!({"always": ["10.0.0.0/8"], "running": ["172.16.0.0/12"]});
            v["metadata"] = json!({"container_workload": "app"});
            v["outbound_connections"] = json!({"limit": true, "logging": true, "burst": 10, "rate_per_sec": 3});
        });
        let u = underlays();
        let fabric = Fabric::new(&config, &ChainNamer::default(), HANDLE, "1.2.3.4", &u).unwrap();
        let chain = fabric.net_out_chain();
        let text: Vec<String> = chain.rules.iter().map(|r| r.to_string()).collect();

        assert!(text[0].contains("RELATED,ESTABLISHED"));
        assert!(text[1].contains("INVALID -j DROP"));
        assert!(text[2].contains("hashlimit") && text[2].ends_with(&format!("-j {}", fabric.names().rate_limit_log)));
        assert_eq!(text[3], "-d 10.0.0.0/8 -j REJECT --reject-with icmp-port-unreachable");
        assert_eq!(text[4], "-d 172.16.0.0/12 -j REJECT --reject-with icmp-port-unreachable");
        assert!(text[5].contains("--log-prefix \"DENY_"));
        assert_eq!(text[6], "-j REJECT --reject-with icmp-port-unreachable");
        assert_eq!(fabric.app_rules_position(), 6);

        assert_eq!(chain.jump_position, JumpPosition::Insert);
        assert_eq!(chain.jump_conditions.len(), 2);
        assert_eq!(
            chain.jump_conditions[1].to_string(),
            "-s 1.2.3.4/32 -o underlay2 -j netout--some-container-id-th"
        );
    }

    #[test]
    fn test_rate_limit_log_chain_in_dry_run_only_logs() {
        let config = config(|v| {
            v["outbound_connections"] = json!({"dry_run": true, "burst": 5, "rate_per_sec": 5});
        });
        let u = underlays();
        let fabric = Fabric::new(&config, &ChainNamer::default(), HANDLE, "1.2.3.4", &u).unwrap();
        let chain = fabric.rate_limit_log_chain();
        assert_eq!(chain.rules.len(), 1);
        assert!(chain.rules[0].to_string().contains("DENY_ORL_"));
        assert!(fabric.chains().unwrap().iter().any(|c| c.name == fabric.names().rate_limit_log));
    }

    #[test]
    fn test_overlay_chain_log_sits_before_reject() {
        let config = config(|v| v["iptables_c2c_logging"] = json!(true));
        let u = underlays();
        let fabric = Fabric::new(&config, &ChainNamer::default(), HANDLE, "1.2.3.4", &u).unwrap();
        let chain = fabric.overlay_chain();
        let text: Vec<String> = chain.rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            text[0],
            "-s 1.2.3.4/32 -o some-device -m mark ! --mark 0x0 -j ACCEPT"
        );
        assert_eq!(text[2], "-d 1.2.3.4/32 -m mark --mark 0xFFFF0000 -j ACCEPT");
        assert!(text[3].contains("--log-prefix \"DENY_C2C_some-container-id- \""));
        assert_eq!(
            text[4],
            "-d 1.2.3.4/32 -j REJECT --reject-with icmp-port-unreachable"
        );
    }

    #[test]
    fn test_mangle_marks_every_port_on_every_underlay() {
        let config = config(|_| {});
        let u = underlays();
        let fabric = Fabric::new(&config, &ChainNamer::default(), HANDLE, "1.2.3.4", &u).unwrap();
        assert_eq!(fabric.net_in_mangle_chain().rules.len(), 4);
        assert_eq!(fabric.net_in_nat_chain().rules.len(), 2);
    }

    #[test]
    fn test_remove_chain_is_tolerant_of_absence() {
        let ipt = InMemoryIpTables::new();
        remove_chain(&ipt, FILTER, Some("FORWARD"), "overlay--gone").unwrap();

        ipt.new_chain(FILTER, "overlay--x").unwrap();
        ipt.append(FILTER, "FORWARD", &rules::new_jump_rule("overlay--x")).unwrap();
        ipt.append(FILTER, "FORWARD", &IpTablesRule::new(&["-j", "ACCEPT"])).unwrap();
        remove_chain(&ipt, FILTER, Some("FORWARD"), "overlay--x").unwrap();

        assert!(!ipt.chain_exists(FILTER, "overlay--x"));
        assert_eq!(ipt.all_rules(FILTER), vec!["-A FORWARD -j ACCEPT".to_string()]);
    }
}
