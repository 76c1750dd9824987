//! Generation-chain enforcement.
//!
//! Every reconciliation writes its rules into a brand new chain named
//! `<prefix><unix micros>`, links it at the top of the parent chain, and only
//! then unlinks and deletes older generations. The parent never points at an
//! empty or half-filled chain, and the newest generation is always evaluated
//! first while two are linked.

use crate::agent::error::{AgentError, AgentResult};
use crate::iptables::{
    jump_rules_to, parse_append_line, rules, IpTables, IpTablesResult, IpTablesRule,
    LockedIpTables,
};
use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Strictly increasing microsecond timestamps, even when the wall clock
/// stalls or steps backwards between calls.
#[derive(Debug, Default)]
pub struct Timestamper {
    last: AtomicI64,
}

impl Timestamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let previous = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        now.max(previous + 1)
    }
}

/// `^<managed>(<10-16 digit timestamp>)$`
pub fn generation_pattern(managed: &str) -> AgentResult<Regex> {
    Ok(Regex::new(&format!(
        "^{}([0-9]{{10,16}})$",
        regex::escape(managed)
    ))?)
}

fn generation_of(pattern: &Regex, chain: &str) -> Option<i64> {
    pattern
        .captures(chain)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One enforcement: replace whatever generation `parent_chain` currently
/// jumps to with a fresh chain holding `rules`.
#[derive(Debug, Clone)]
pub struct Enforcement<'a> {
    pub table: &'a str,
    pub parent_chain: &'a str,
    pub chain_prefix: &'a str,
    pub managed_chains: &'a str,
    /// delete every parent rule other than the jump to the new generation
    pub cleanup_parent_chain: bool,
    pub rules: Vec<IpTablesRule>,
}

pub struct Enforcer {
    ipt: Arc<LockedIpTables>,
    stamper: Arc<Timestamper>,
    overlay_allow_all: Option<String>,
}

impl Enforcer {
    pub fn new(ipt: Arc<LockedIpTables>, stamper: Arc<Timestamper>) -> Self {
        Self {
            ipt,
            stamper,
            overlay_allow_all: None,
        }
    }

    /// Prepend an accept for traffic within `overlay_cidr` to every generation
    pub fn with_overlay_allow_all(mut self, overlay_cidr: &str) -> Self {
        self.overlay_allow_all = Some(overlay_cidr.to_string());
        self
    }

    /// Install a new generation and retire the older ones; returns the new chain name.
    pub fn enforce(&self, enforcement: Enforcement<'_>) -> AgentResult<String> {
        let pattern = generation_pattern(enforcement.managed_chains)?;
        let stamp = self.stamper.next();
        let chain = format!("{}{}", enforcement.chain_prefix, stamp);

        let mut chain_rules = Vec::with_capacity(enforcement.rules.len() + 1);
        if let Some(cidr) = &self.overlay_allow_all {
            chain_rules.push(rules::new_overlay_allow_all_rule(cidr));
        }
        chain_rules.extend(enforcement.rules.iter().cloned());

        let table = enforcement.table;
        let parent = enforcement.parent_chain;
        self.ipt
            .locked(|ipt| {
                install_generation(ipt, table, parent, &chain, &chain_rules)?;
                retire_generations(ipt, table, parent, &pattern, stamp)?;
                if enforcement.cleanup_parent_chain {
                    clean_parent(ipt, table, parent, &chain)?;
                }
                Ok(())
            })
            .map_err(|e| AgentError::enforce(&chain, e))?;

        debug!(table, parent, chain = %chain, rules = chain_rules.len(), "enforced generation");
        Ok(chain)
    }

    /// Delete every generation matching `managed_chains`, unlinking it from
    /// `parent_chain` first when that chain still exists.
    pub fn remove_generations(
        &self,
        table: &str,
        parent_chain: &str,
        managed_chains: &str,
    ) -> AgentResult<usize> {
        let pattern = generation_pattern(managed_chains)?;
        self.ipt
            .locked(|ipt| {
                let chains = ipt.list_chains(table)?;
                let doomed: Vec<&String> = chains
                    .iter()
                    .filter(|c| generation_of(&pattern, c).is_some())
                    .collect();
                let parent_exists = chains.iter().any(|c| c == parent_chain);

                for chain in &doomed {
                    if parent_exists {
                        for jump in jump_rules_to(ipt, table, parent_chain, chain)? {
                            ipt.delete(table, parent_chain, &jump)?;
                        }
                    }
                    ipt.clear_chain(table, chain)?;
                    ipt.delete_chain(table, chain)?;
                }
                Ok(doomed.len())
            })
            .map_err(|e| AgentError::enforce(managed_chains, e))
    }

    /// Delete chains under `prefix` whose owner tag (the `owner_len` hex
    /// characters between the prefix and the timestamp) is not in `live`.
    pub fn sweep_unowned(
        &self,
        table: &str,
        prefix: &str,
        owner_len: usize,
        live: &HashSet<String>,
    ) -> AgentResult<usize> {
        let pattern = Regex::new(&format!(
            "^{}([0-9a-f]{{{}}})([0-9]{{10,16}})$",
            regex::escape(prefix),
            owner_len
        ))?;

        self.ipt
            .locked(|ipt| {
                let chains = ipt.list_chains(table)?;
                let referenced = referenced_chains(ipt, table, &chains)?;
                let mut removed = 0;
                for chain in &chains {
                    let Some(owner) = pattern.captures(chain).and_then(|c| c.get(1)) else {
                        continue;
                    };
                    if live.contains(owner.as_str()) {
                        continue;
                    }
                    if referenced.contains(chain.as_str()) {
                        warn!(table, chain = %chain, "orphaned chain is still referenced, leaving it");
                        continue;
                    }
                    ipt.clear_chain(table, chain)?;
                    ipt.delete_chain(table, chain)?;
                    removed += 1;
                }
                Ok(removed)
            })
            .map_err(|e| AgentError::enforce(prefix, e))
    }
}

fn install_generation(
    ipt: &dyn IpTables,
    table: &str,
    parent: &str,
    chain: &str,
    chain_rules: &[IpTablesRule],
) -> IpTablesResult<()> {
    ipt.new_chain(table, chain)?;
    let jump = rules::new_jump_rule(chain);
    if let Err(e) = ipt.bulk_insert(table, parent, 1, std::slice::from_ref(&jump)) {
        report_undo(table, chain, [("deleting", ipt.delete_chain(table, chain))]);
        return Err(e);
    }
    if let Err(e) = ipt.bulk_append(table, chain, chain_rules) {
        report_undo(
            table,
            chain,
            [
                ("unlinking", ipt.delete(table, parent, &jump)),
                ("clearing", ipt.clear_chain(table, chain)),
                ("deleting", ipt.delete_chain(table, chain)),
            ],
        );
        return Err(e);
    }
    Ok(())
}

/// The install error is what callers see; failed undo steps are only logged.
fn report_undo<const N: usize>(
    table: &str,
    chain: &str,
    steps: [(&str, IpTablesResult<()>); N],
) {
    for (step, result) in steps {
        if let Err(e) = result {
            warn!(table, chain, step, error = %e, "undoing generation install");
        }
    }
}

/// Unlink and delete generations older than `stamp`, including ones a crash
/// left behind without a jump from the parent.
fn retire_generations(
    ipt: &dyn IpTables,
    table: &str,
    parent: &str,
    pattern: &Regex,
    stamp: i64,
) -> IpTablesResult<()> {
    for line in ipt.list(table, parent)? {
        let Some(rule) = parse_append_line(&line, parent) else {
            continue;
        };
        let older = rule
            .jump_target()
            .and_then(|target| generation_of(pattern, target))
            .is_some_and(|ts| ts < stamp);
        if older {
            ipt.delete(table, parent, &rule)?;
        }
    }

    for chain in ipt.list_chains(table)? {
        if generation_of(pattern, &chain).is_some_and(|ts| ts < stamp) {
            ipt.clear_chain(table, &chain)?;
            ipt.delete_chain(table, &chain)?;
        }
    }
    Ok(())
}

fn clean_parent(ipt: &dyn IpTables, table: &str, parent: &str, keep: &str) -> IpTablesResult<()> {
    for line in ipt.list(table, parent)? {
        let Some(rule) = parse_append_line(&line, parent) else {
            continue;
        };
        if rule.jump_target() != Some(keep) {
            ipt.delete(table, parent, &rule)?;
        }
    }
    Ok(())
}

fn referenced_chains(
    ipt: &dyn IpTables,
    table: &str,
    chains: &[String],
) -> IpTablesResult<HashSet<String>> {
    let mut referenced = HashSet::new();
    for chain in chains {
        for line in ipt.list(table, chain)? {
            if let Some(target) = parse_append_line(&line, chain)
                .as_ref()
                .and_then(IpTablesRule::jump_target)
            {
                referenced.insert(target.to_string());
            }
        }
    }
    Ok(referenced)
}
