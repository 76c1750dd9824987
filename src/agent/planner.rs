//! Container-to-container planner.
//!
//! `plan` is a pure function of the datastore snapshot, the policy snapshot and
//! the logging flag. Every category is sorted by the canonical JSON of the
//! inputs that produced each rule, so policies returned in any order yield
//! byte-identical rule lists.

use crate::agent::error::AgentResult;
use crate::agent::policy_client::{EgressPolicy, PolicyServiceClient, PolicySet};
use crate::datastore::{Container, Containers, Store};
use crate::iptables::converter::{IcmpInfo, NetOutRule, Protocol, RuleConverter};
use crate::iptables::rules;
use crate::iptables::IpTablesRule;
use crate::utils::constants::{INGRESS_ROUTER_ID, INGRESS_ROUTER_TYPE};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Serialize)]
struct MarkSet<'a> {
    ip: &'a str,
    tag: &'a str,
    app: &'a str,
}

#[derive(Serialize)]
struct MarkAllow<'a> {
    dest_ip: &'a str,
    protocol: &'a str,
    start_port: u16,
    end_port: u16,
    tag: &'a str,
    source_app: &'a str,
    dest_app: &'a str,
}

#[derive(Serialize)]
struct Egress<'a> {
    container_ip: &'a str,
    underlay: &'a str,
    policy: &'a EgressPolicy,
}

#[derive(Serialize)]
struct Ingress<'a> {
    dest_ip: &'a str,
    port: u16,
}

/// Sort by canonical JSON and drop duplicates
fn canonical_order<T: Serialize>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut keyed: BTreeMap<String, T> = BTreeMap::new();
    for item in items {
        match serde_json::to_string(&item) {
            Ok(key) => {
                keyed.entry(key).or_insert(item);
            }
            Err(e) => warn!(error = %e, "skipping unserialisable rule input"),
        }
    }
    keyed.into_values().collect()
}

fn source_matches(policy: &EgressPolicy, container: &Container) -> bool {
    match policy.source.source_type.as_str() {
        "default" => true,
        "space" => !container.space_id().is_empty() && policy.source.id == container.space_id(),
        _ => !container.policy_group_id().is_empty() && policy.source.id == container.policy_group_id(),
    }
}

/// `running` covers apps and tasks; an unknown workload matches every lifecycle
pub fn lifecycle_matches(lifecycle: &str, workload: &str) -> bool {
    match (lifecycle, workload) {
        ("" | "all", _) | (_, "") => true,
        ("running", "app" | "task") => true,
        ("staging", "staging") => true,
        _ => false,
    }
}

fn egress_rule(policy: &EgressPolicy) -> Option<NetOutRule> {
    let destination = &policy.destination;
    let protocol: Protocol = match destination.protocol.parse() {
        Ok(protocol) => protocol,
        Err(e) => {
            warn!(error = %e, "skipping egress policy");
            return None;
        }
    };
    Some(NetOutRule {
        protocol,
        networks: destination.ips.clone(),
        ports: destination.ports.clone(),
        icmp_info: destination.icmp_type.map(|icmp_type| IcmpInfo {
            icmp_type,
            code: destination.icmp_code.unwrap_or(-1),
        }),
        log: false,
    })
}

pub struct C2cPlanner {
    underlays: Vec<String>,
    enable_overlay_ingress_rules: bool,
    accepted_logs_per_sec: u32,
}

impl C2cPlanner {
    pub fn new(underlays: Vec<String>, enable_overlay_ingress_rules: bool, accepted_logs_per_sec: u32) -> Self {
        Self {
            underlays,
            enable_overlay_ingress_rules,
            accepted_logs_per_sec,
        }
    }

    /// App and space ids the policy service is asked about
    pub fn policy_ids(containers: &Containers) -> Vec<String> {
        let ids: BTreeSet<&str> = containers
            .values()
            .flat_map(|c| [c.policy_group_id(), c.space_id()])
            .filter(|id| !id.is_empty())
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }

    pub async fn fetch_and_plan(
        &self,
        store: &Store,
        client: &dyn PolicyServiceClient,
        logging: bool,
    ) -> AgentResult<Vec<IpTablesRule>> {
        let containers = store.read_all()?;
        let ids = Self::policy_ids(&containers);
        let policies = if ids.is_empty() {
            PolicySet::default()
        } else {
            client.policies_by_id(&ids).await?
        };

        let ingress_tag = if self.enable_overlay_ingress_rules {
            Some(
                client
                    .create_or_get_tag(INGRESS_ROUTER_ID, INGRESS_ROUTER_TYPE)
                    .await?,
            )
        } else {
            None
        };

        let planned = self.plan(&containers, &policies, ingress_tag.as_deref(), logging);
        debug!(
            containers = containers.len(),
            policies = policies.policies.len(),
            egress_policies = policies.egress_policies.len(),
            rules = planned.len(),
            "planned c2c rules"
        );
        Ok(planned)
    }

    pub fn plan(
        &self,
        containers: &Containers,
        policies: &PolicySet,
        ingress_tag: Option<&str>,
        logging: bool,
    ) -> Vec<IpTablesRule> {
        let mut out = Vec::new();

        // one mark per source ip, even when the app is the source of several policies
        let mut marks: BTreeMap<&str, MarkSet> = BTreeMap::new();
        for policy in &policies.policies {
            for container in containers.values() {
                if container.policy_group_id() == policy.source.id {
                    marks.entry(container.ip.as_str()).or_insert(MarkSet {
                        ip: &container.ip,
                        tag: &policy.source.tag,
                        app: &policy.source.id,
                    });
                }
            }
        }
        for mark in canonical_order(marks.into_values()) {
            out.push(rules::new_mark_set_rule(mark.ip, mark.tag, mark.app));
        }

        let allows = policies.policies.iter().flat_map(|policy| {
            containers
                .values()
                .filter(move |c| c.policy_group_id() == policy.destination.id)
                .map(move |c| MarkAllow {
                    dest_ip: &c.ip,
                    protocol: &policy.destination.protocol,
                    start_port: policy.destination.ports.start,
                    end_port: policy.destination.ports.end,
                    tag: &policy.source.tag,
                    source_app: &policy.source.id,
                    dest_app: &policy.destination.id,
                })
        });
        for allow in canonical_order(allows) {
            if logging {
                out.push(rules::new_mark_allow_log_rule(
                    allow.dest_ip,
                    allow.protocol,
                    allow.start_port,
                    allow.end_port,
                    allow.tag,
                    allow.dest_app,
                    self.accepted_logs_per_sec,
                ));
            }
            out.push(rules::new_mark_allow_rule(
                allow.dest_ip,
                allow.protocol,
                allow.start_port,
                allow.end_port,
                allow.tag,
                allow.source_app,
                allow.dest_app,
            ));
        }

        let mut egress = Vec::new();
        for container in containers.values() {
            for policy in &policies.egress_policies {
                if !source_matches(policy, container)
                    || !lifecycle_matches(&policy.app_lifecycle, container.workload())
                {
                    continue;
                }
                for underlay in &self.underlays {
                    egress.push(Egress {
                        container_ip: &container.ip,
                        underlay,
                        policy,
                    });
                }
            }
        }
        let converter = RuleConverter::new("", false);
        for entry in canonical_order(egress) {
            if let Some(rule) = egress_rule(entry.policy) {
                for converted in converter.convert(&rule) {
                    out.push(rules::scoped_to_interface(
                        entry.container_ip,
                        entry.underlay,
                        converted,
                    ));
                }
            }
        }

        if let Some(tag) = ingress_tag {
            let ingress = containers.values().flat_map(|c| {
                c.ports().into_iter().map(move |port| Ingress {
                    dest_ip: &c.ip,
                    port,
                })
            });
            for entry in canonical_order(ingress) {
                out.push(rules::new_mark_allow_no_comment_rule(
                    entry.dest_ip,
                    "tcp",
                    entry.port,
                    tag,
                ));
            }
        }

        out
    }
}
