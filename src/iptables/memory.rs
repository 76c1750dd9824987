//! In-memory packet filter used by tests.
//!
//! Mirrors the iptables semantics the rest of the crate depends on: built-in
//! chains cannot be created or removed, user chains must be empty and
//! unreferenced before deletion, rule deletion requires an exact match, and
//! bulk edits apply all-or-nothing.

use crate::iptables::error::{IpTablesError, IpTablesResult};
use crate::iptables::{builtin_chains, split_rule_line, IpTables, IpTablesRule, LockedIpTables, Locker};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type Chains = Vec<(String, Vec<IpTablesRule>)>;

pub struct InMemoryIpTables {
    tables: Mutex<BTreeMap<String, Chains>>,
}

impl Default for InMemoryIpTables {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIpTables {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for table in ["filter", "nat", "mangle"] {
            tables.insert(table.to_string(), fresh_table(table));
        }
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Every rule of a table in `iptables -S` form, chain by chain
    pub fn all_rules(&self, table: &str) -> Vec<String> {
        let tables = self.tables.lock();
        let mut lines = Vec::new();
        if let Some(chains) = tables.get(table) {
            for (name, rules) in chains {
                for rule in rules {
                    lines.push(format!("-A {} {}", name, rule));
                }
            }
        }
        lines
    }

    pub fn chain_exists(&self, table: &str, chain: &str) -> bool {
        let tables = self.tables.lock();
        tables
            .get(table)
            .map(|chains| chains.iter().any(|(name, _)| name == chain))
            .unwrap_or(false)
    }

    pub fn chain_rules(&self, table: &str, chain: &str) -> Vec<IpTablesRule> {
        let tables = self.tables.lock();
        tables
            .get(table)
            .and_then(|chains| chains.iter().find(|(name, _)| name == chain))
            .map(|(_, rules)| rules.clone())
            .unwrap_or_default()
    }

    fn with_table<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Chains) -> IpTablesResult<R>,
    ) -> IpTablesResult<R> {
        let mut tables = self.tables.lock();
        let chains = tables
            .get_mut(table)
            .ok_or_else(|| IpTablesError::Chain(format!("table {} does not exist", table)))?;

        // work on a copy so a failed multi-rule edit leaves nothing behind
        let mut scratch = chains.clone();
        let result = f(&mut scratch)?;
        *chains = scratch;
        Ok(result)
    }
}

/// Lock that is always free; the in-memory tables need no inter-process lock.
pub struct NoopLocker;

impl Locker for NoopLocker {
    fn lock(&self) -> IpTablesResult<()> {
        Ok(())
    }

    fn unlock(&self) -> IpTablesResult<()> {
        Ok(())
    }
}

/// A fresh in-memory filter plus a locked adapter over it
pub fn locked_in_memory() -> (Arc<InMemoryIpTables>, LockedIpTables) {
    let ipt = Arc::new(InMemoryIpTables::new());
    let locked = LockedIpTables::new(Box::new(ipt.clone()), Box::new(NoopLocker));
    (ipt, locked)
}

/// Filter operations `FailingIpTables` can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    NewChain,
    BulkAppend,
    BulkInsert,
    Delete,
}

/// Wraps an in-memory filter and fails the `nth` (1-based) call of `op`
/// against `chain`; every other call reaches the wrapped tables.
pub struct FailingIpTables {
    inner: Arc<InMemoryIpTables>,
    op: Op,
    chain: String,
    nth: usize,
    seen: Mutex<usize>,
}

impl FailingIpTables {
    pub fn new(inner: Arc<InMemoryIpTables>, op: Op, chain: &str, nth: usize) -> Self {
        Self {
            inner,
            op,
            chain: chain.to_string(),
            nth,
            seen: Mutex::new(0),
        }
    }

    fn trip(&self, op: Op, chain: &str) -> IpTablesResult<()> {
        if op != self.op || chain != self.chain {
            return Ok(());
        }
        let mut seen = self.seen.lock();
        *seen += 1;
        if *seen == self.nth {
            return Err(IpTablesError::Command {
                cmd: format!("{:?} {}", op, chain),
                stderr: "resource temporarily unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl IpTables for FailingIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.trip(Op::NewChain, chain)?;
        self.inner.new_chain(table, chain)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.inner.delete_chain(table, chain)
    }

    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.inner.clear_chain(table, chain)
    }

    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.inner.append(table, chain, rule)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()> {
        self.inner.insert(table, chain, position, rule)
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.trip(Op::Delete, chain)?;
        self.inner.delete(table, chain, rule)
    }

    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool> {
        self.inner.exists(table, chain, rule)
    }

    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>> {
        self.inner.list(table, chain)
    }

    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>> {
        self.inner.list_chains(table)
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()> {
        self.trip(Op::BulkAppend, chain)?;
        self.inner.bulk_append(table, chain, rules)
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()> {
        self.trip(Op::BulkInsert, chain)?;
        self.inner.bulk_insert(table, chain, position, rules)
    }

    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()> {
        self.inner.flush_and_restore(script)
    }

    fn rule_count(&self, table: &str) -> IpTablesResult<usize> {
        self.inner.rule_count(table)
    }
}

fn fresh_table(table: &str) -> Chains {
    builtin_chains(table)
        .iter()
        .map(|c| (c.to_string(), Vec::new()))
        .collect()
}

fn find<'a>(chains: &'a mut Chains, chain: &str) -> IpTablesResult<&'a mut Vec<IpTablesRule>> {
    chains
        .iter_mut()
        .find(|(name, _)| name == chain)
        .map(|(_, rules)| rules)
        .ok_or_else(|| IpTablesError::Chain(format!("no chain/target/match by that name: {}", chain)))
}

fn check_target(chains: &Chains, rule: &IpTablesRule) -> IpTablesResult<()> {
    if let Some(target) = rule.jump_target() {
        let is_extension = target.chars().all(|c| c.is_ascii_uppercase());
        if !is_extension && !chains.iter().any(|(name, _)| name == target) {
            return Err(IpTablesError::Chain(format!(
                "couldn't load target `{}': no such chain",
                target
            )));
        }
    }
    Ok(())
}

fn append_rule(chains: &mut Chains, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
    check_target(chains, rule)?;
    find(chains, chain)?.push(rule.clone());
    Ok(())
}

fn insert_rule(
    chains: &mut Chains,
    chain: &str,
    position: usize,
    rule: &IpTablesRule,
) -> IpTablesResult<()> {
    check_target(chains, rule)?;
    let rules = find(chains, chain)?;
    if position == 0 || position > rules.len() + 1 {
        return Err(IpTablesError::Rule(format!(
            "index of insertion too big: {} in {}",
            position, chain
        )));
    }
    rules.insert(position - 1, rule.clone());
    Ok(())
}

fn delete_rule(chains: &mut Chains, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
    let rules = find(chains, chain)?;
    match rules.iter().position(|r| r == rule) {
        Some(idx) => {
            rules.remove(idx);
            Ok(())
        }
        None => Err(IpTablesError::Rule(format!(
            "bad rule (does a matching rule exist in {}?): {}",
            chain, rule
        ))),
    }
}

fn new_chain(chains: &mut Chains, chain: &str) -> IpTablesResult<()> {
    if chains.iter().any(|(name, _)| name == chain) {
        return Err(IpTablesError::Chain(format!("chain already exists: {}", chain)));
    }
    chains.push((chain.to_string(), Vec::new()));
    Ok(())
}

fn delete_chain(table: &str, chains: &mut Chains, chain: &str) -> IpTablesResult<()> {
    if builtin_chains(table).contains(&chain) {
        return Err(IpTablesError::Chain(format!("cannot delete built-in chain {}", chain)));
    }
    let idx = chains
        .iter()
        .position(|(name, _)| name == chain)
        .ok_or_else(|| IpTablesError::Chain(format!("no chain by that name: {}", chain)))?;
    if !chains[idx].1.is_empty() {
        return Err(IpTablesError::Chain(format!("directory not empty: {}", chain)));
    }
    let referenced = chains
        .iter()
        .flat_map(|(_, rules)| rules.iter())
        .any(|r| r.jump_target() == Some(chain));
    if referenced {
        return Err(IpTablesError::Chain(format!("too many links: {}", chain)));
    }
    chains.remove(idx);
    Ok(())
}

impl IpTables for InMemoryIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.with_table(table, |chains| new_chain(chains, chain))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.with_table(table, |chains| delete_chain(table, chains, chain))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.with_table(table, |chains| {
            find(chains, chain)?.clear();
            Ok(())
        })
    }

    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.with_table(table, |chains| append_rule(chains, chain, rule))
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()> {
        self.with_table(table, |chains| insert_rule(chains, chain, position, rule))
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.with_table(table, |chains| delete_rule(chains, chain, rule))
    }

    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool> {
        Ok(self.chain_rules(table, chain).contains(rule))
    }

    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>> {
        let tables = self.tables.lock();
        let chains = tables
            .get(table)
            .ok_or_else(|| IpTablesError::Chain(format!("table {} does not exist", table)))?;
        let (name, rules) = chains
            .iter()
            .find(|(name, _)| name == chain)
            .ok_or_else(|| IpTablesError::Chain(format!("no chain by that name: {}", chain)))?;

        let mut lines = Vec::with_capacity(rules.len() + 1);
        if builtin_chains(table).contains(&name.as_str()) {
            lines.push(format!("-P {} ACCEPT", name));
        } else {
            lines.push(format!("-N {}", name));
        }
        lines.extend(rules.iter().map(|r| format!("-A {} {}", name, r)));
        Ok(lines)
    }

    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .map(|chains| chains.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()> {
        self.with_table(table, |chains| {
            for rule in rules {
                append_rule(chains, chain, rule)?;
            }
            Ok(())
        })
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()> {
        self.with_table(table, |chains| {
            for (i, rule) in rules.iter().enumerate() {
                insert_rule(chains, chain, position + i, rule)?;
            }
            Ok(())
        })
    }

    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()> {
        let mut staged: BTreeMap<String, Chains> = BTreeMap::new();
        let mut current: Option<(String, Chains)> = None;

        for raw in script.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(table) = line.strip_prefix('*') {
                current = Some((table.to_string(), fresh_table(table)));
                continue;
            }
            let (table, chains) = current
                .as_mut()
                .ok_or_else(|| IpTablesError::Parse(format!("line outside table: {}", line)))?;
            if line == "COMMIT" {
                staged.insert(table.clone(), std::mem::take(chains));
                current = None;
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                let name = decl.split_whitespace().next().unwrap_or_default();
                if !builtin_chains(table).contains(&name) {
                    new_chain(chains, name)?;
                }
                continue;
            }

            let args = split_rule_line(line);
            match (args.first().map(|s| s.as_str()), args.get(1)) {
                (Some("-A"), Some(chain)) => {
                    let rule = IpTablesRule::from_args(args[2..].to_vec());
                    append_rule(chains, chain, &rule)?;
                }
                (Some("-N"), Some(chain)) => new_chain(chains, chain)?,
                _ => {
                    return Err(IpTablesError::Parse(format!(
                        "unsupported restore line: {}",
                        line
                    )))
                }
            }
        }

        if current.is_some() {
            return Err(IpTablesError::Parse("missing COMMIT".to_string()));
        }

        let mut tables = self.tables.lock();
        for (table, chains) in staged {
            tables.insert(table, chains);
        }
        Ok(())
    }

    fn rule_count(&self, table: &str) -> IpTablesResult<usize> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .map(|chains| chains.iter().map(|(_, rules)| rules.len()).sum())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(args: &[&str]) -> IpTablesRule {
        IpTablesRule::new(args)
    }

    #[test]
    fn test_bulk_insert_keeps_given_order() {
        let ipt = InMemoryIpTables::new();
        ipt.new_chain("filter", "c").unwrap();
        ipt.append("filter", "c", &rule(&["-j", "REJECT"])).unwrap();
        ipt.bulk_insert(
            "filter",
            "c",
            1,
            &[rule(&["-d", "1.1.1.1/32", "-j", "ACCEPT"]), rule(&["-d", "2.2.2.2/32", "-j", "ACCEPT"])],
        )
        .unwrap();

        assert_eq!(
            ipt.list("filter", "c").unwrap(),
            vec![
                "-N c",
                "-A c -d 1.1.1.1/32 -j ACCEPT",
                "-A c -d 2.2.2.2/32 -j ACCEPT",
                "-A c -j REJECT",
            ]
        );
    }

    #[test]
    fn test_failed_bulk_edit_changes_nothing() {
        let ipt = InMemoryIpTables::new();
        ipt.new_chain("filter", "c").unwrap();
        let result = ipt.bulk_append(
            "filter",
            "c",
            &[rule(&["-j", "ACCEPT"]), rule(&["-j", "missing-chain"])],
        );
        assert!(result.is_err());
        assert!(ipt.chain_rules("filter", "c").is_empty());
    }

    #[test]
    fn test_referenced_chain_cannot_be_deleted() {
        let ipt = InMemoryIpTables::new();
        ipt.new_chain("filter", "c").unwrap();
        ipt.append("filter", "FORWARD", &rule(&["-j", "c"])).unwrap();
        assert!(ipt.delete_chain("filter", "c").is_err());
        ipt.delete("filter", "FORWARD", &rule(&["-j", "c"])).unwrap();
        ipt.delete_chain("filter", "c").unwrap();
        assert!(!ipt.chain_exists("filter", "c"));
    }

    #[test]
    fn test_flush_and_restore_replaces_table() {
        let ipt = InMemoryIpTables::new();
        ipt.new_chain("nat", "old").unwrap();
        ipt.flush_and_restore("*nat\n:POSTROUTING ACCEPT [0:0]\n:fresh - [0:0]\n-A fresh -j MASQUERADE\nCOMMIT\n")
            .unwrap();
        assert!(!ipt.chain_exists("nat", "old"));
        assert_eq!(ipt.all_rules("nat"), vec!["-A fresh -j MASQUERADE"]);
        assert_eq!(ipt.rule_count("nat").unwrap(), 1);
    }

    #[test]
    fn test_failing_tables_fail_only_the_chosen_call() {
        let inner = Arc::new(InMemoryIpTables::new());
        let ipt = FailingIpTables::new(inner.clone(), Op::BulkAppend, "c", 2);
        ipt.new_chain("filter", "c").unwrap();
        ipt.new_chain("filter", "d").unwrap();

        ipt.bulk_append("filter", "c", &[rule(&["-j", "ACCEPT"])]).unwrap();
        ipt.bulk_append("filter", "d", &[rule(&["-j", "ACCEPT"])]).unwrap();
        let err = ipt.bulk_append("filter", "c", &[rule(&["-j", "DROP"])]).unwrap_err();
        assert!(err.to_string().contains("BulkAppend c"), "{}", err);
        ipt.bulk_append("filter", "c", &[rule(&["-j", "REJECT"])]).unwrap();

        assert_eq!(
            inner.all_rules("filter"),
            vec!["-A c -j ACCEPT", "-A c -j REJECT", "-A d -j ACCEPT"]
        );
    }
}
