// Packet-filter layer - rule vocabulary, chain naming, and serialised access to iptables.
// Everything that mutates the host's filter tables goes through the `IpTables` trait.

pub mod command;
pub mod converter;
pub mod error;
pub mod locked;
#[cfg(test)]
pub mod memory;
pub mod namer;
pub mod rules;

pub use command::CommandIpTables;
pub use converter::{NetOutRule, RuleConverter};
pub use error::{IpTablesError, IpTablesResult};
pub use locked::{FileLocker, LockedIpTables, Locker};
pub use namer::ChainNamer;

use std::fmt;

pub const FILTER: &str = "filter";
pub const NAT: &str = "nat";
pub const MANGLE: &str = "mangle";

/// Built-in chains per table; these can never be created or deleted.
pub fn builtin_chains(table: &str) -> &'static [&'static str] {
    match table {
        FILTER => &["INPUT", "FORWARD", "OUTPUT"],
        NAT => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        MANGLE => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        _ => &[],
    }
}

/// One rule specification: the ordered argument list handed to the packet filter.
/// Two rules are equal iff their argument lists are element-wise equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpTablesRule(Vec<String>);

impl IpTablesRule {
    pub fn new(args: &[&str]) -> Self {
        Self(args.iter().map(|a| a.to_string()).collect())
    }

    pub fn from_args(args: Vec<String>) -> Self {
        Self(args)
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Arguments with restore-style double quotes removed, for exec-style invocation
    pub fn unquoted_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|a| {
                if a.len() >= 2 && a.starts_with('"') && a.ends_with('"') {
                    a[1..a.len() - 1].to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    /// Append further arguments, producing a new rule
    pub fn with(mut self, more: &[&str]) -> Self {
        self.0.extend(more.iter().map(|a| a.to_string()));
        self
    }

    /// Target of `-j`/`-g`, if the rule has one
    pub fn jump_target(&self) -> Option<&str> {
        self.0
            .iter()
            .position(|a| a == "-j" || a == "-g")
            .and_then(|i| self.0.get(i + 1))
            .map(|s| s.as_str())
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.0.iter().any(|a| a.contains(needle))
    }
}

impl fmt::Display for IpTablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// Serialised access to one host's packet filter.
///
/// `list` returns lines in the `iptables -S <chain>` format: a `-N <chain>`
/// (or `-P <chain> <policy>`) header followed by one `-A <chain> <args>` per rule.
pub trait IpTables: Send + Sync {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()>;
    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()>;
    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()>;
    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()>;
    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()>;
    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()>;
    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool>;
    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>>;
    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>>;
    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()>;
    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()>;
    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()>;
    fn rule_count(&self, table: &str) -> IpTablesResult<usize>;
}

impl<T: IpTables + ?Sized> IpTables for std::sync::Arc<T> {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        (**self).new_chain(table, chain)
    }
    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        (**self).delete_chain(table, chain)
    }
    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        (**self).clear_chain(table, chain)
    }
    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        (**self).append(table, chain, rule)
    }
    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()> {
        (**self).insert(table, chain, position, rule)
    }
    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        (**self).delete(table, chain, rule)
    }
    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool> {
        (**self).exists(table, chain, rule)
    }
    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>> {
        (**self).list(table, chain)
    }
    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>> {
        (**self).list_chains(table)
    }
    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()> {
        (**self).bulk_append(table, chain, rules)
    }
    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()> {
        (**self).bulk_insert(table, chain, position, rules)
    }
    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()> {
        (**self).flush_and_restore(script)
    }
    fn rule_count(&self, table: &str) -> IpTablesResult<usize> {
        (**self).rule_count(table)
    }
}

/// Split one `iptables -S` line into arguments. Double-quoted spans stay a single
/// argument and keep their quotes, matching how rules are built.
pub fn split_rule_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Parse an `-A <chain> <args...>` listing line into the rule it describes.
/// Returns None for header lines and lines belonging to other chains.
pub fn parse_append_line(line: &str, chain: &str) -> Option<IpTablesRule> {
    let mut args = split_rule_line(line);
    if args.len() < 2 || args[0] != "-A" || args[1] != chain {
        return None;
    }
    Some(IpTablesRule::from_args(args.split_off(2)))
}

/// Render a restore script for one table: one command line per entry, then COMMIT.
pub fn restore_script(table: &str, lines: &[String]) -> String {
    let mut script = format!("*{}\n", table);
    for line in lines {
        script.push_str(line);
        script.push('\n');
    }
    script.push_str("COMMIT\n");
    script
}

/// Rules in `parent_chain` that jump straight to `chain`
pub fn jump_rules_to(
    ipt: &dyn IpTables,
    table: &str,
    parent_chain: &str,
    chain: &str,
) -> IpTablesResult<Vec<IpTablesRule>> {
    Ok(ipt
        .list(table, parent_chain)?
        .iter()
        .filter_map(|line| parse_append_line(line, parent_chain))
        .filter(|rule| rule.jump_target() == Some(chain))
        .collect())
}

/// Remove a chain entirely: delete its jump rules from the parent chain, then
/// flush and delete the chain itself. Jumps must go first or the delete fails.
pub fn teardown_chain(
    ipt: &dyn IpTables,
    table: &str,
    parent_chain: &str,
    jump_rules: &[IpTablesRule],
    chain: &str,
) -> IpTablesResult<()> {
    for jump in jump_rules {
        ipt.delete(table, parent_chain, jump)?;
    }
    ipt.clear_chain(table, chain)?;
    ipt.delete_chain(table, chain)
}
