use crate::iptables::error::{IpTablesError, IpTablesResult};
use crate::iptables::{restore_script, IpTables, IpTablesRule};
use std::io::Write;
use std::process::{Command, Stdio};

/// iptables backend that shells out to the host's `iptables`, `iptables-restore`
/// and `iptables-save` binaries.
///
/// Rule edits go through `iptables-restore --noflush` so quoted arguments (log
/// prefixes) are parsed the same way for single edits and bulk edits. Chain
/// lifecycle and queries use plain `iptables` invocations.
pub struct CommandIpTables {
    iptables: String,
    restore: String,
    save: String,
}

impl Default for CommandIpTables {
    fn default() -> Self {
        Self::new("iptables", "iptables-restore", "iptables-save")
    }
}

impl CommandIpTables {
    pub fn new(iptables: &str, restore: &str, save: &str) -> Self {
        Self {
            iptables: iptables.to_string(),
            restore: restore.to_string(),
            save: save.to_string(),
        }
    }

    fn run(&self, args: &[String]) -> IpTablesResult<String> {
        let output = Command::new(&self.iptables)
            .arg("-w")
            .args(args)
            .output()
            .map_err(IpTablesError::Io)?;

        if !output.status.success() {
            return Err(IpTablesError::Command {
                cmd: format!("{} -w {}", self.iptables, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn table_args(table: &str, flag: &str, chain: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            table.to_string(),
            flag.to_string(),
            chain.to_string(),
        ]
    }

    fn restore(&self, script: &str, noflush: bool) -> IpTablesResult<()> {
        let mut cmd = Command::new(&self.restore);
        cmd.arg("-w");
        if noflush {
            cmd.arg("--noflush");
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(IpTablesError::Io)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).map_err(IpTablesError::Io)?;
        }

        let output = child.wait_with_output().map_err(IpTablesError::Io)?;
        if !output.status.success() {
            return Err(IpTablesError::Command {
                cmd: format!("{} -w --noflush <<< {}", self.restore, script.trim()),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn restore_lines(&self, table: &str, lines: Vec<String>) -> IpTablesResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.restore(&restore_script(table, &lines), true)
    }
}

impl IpTables for CommandIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.run(&Self::table_args(table, "-N", chain)).map(|_| ())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.run(&Self::table_args(table, "-X", chain)).map(|_| ())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.run(&Self::table_args(table, "-F", chain)).map(|_| ())
    }

    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.restore_lines(table, vec![format!("-A {} {}", chain, rule)])
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()> {
        self.restore_lines(table, vec![format!("-I {} {} {}", chain, position, rule)])
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.restore_lines(table, vec![format!("-D {} {}", chain, rule)])
    }

    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool> {
        let mut args = Self::table_args(table, "-C", chain);
        args.extend(rule.unquoted_args());

        let output = Command::new(&self.iptables)
            .arg("-w")
            .args(&args)
            .output()
            .map_err(IpTablesError::Io)?;

        match output.status.code() {
            Some(0) => Ok(true),
            // iptables -C exits 1 when the rule (or its chain) is absent
            Some(1) => Ok(false),
            _ => Err(IpTablesError::Command {
                cmd: format!("{} -w {}", self.iptables, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
        }
    }

    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>> {
        let stdout = self.run(&Self::table_args(table, "-S", chain))?;
        Ok(stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>> {
        let stdout = self.run(&["-t".to_string(), table.to_string(), "-S".to_string()])?;
        let mut chains = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("-N"), Some(name)) | (Some("-P"), Some(name)) => {
                    chains.push(name.to_string())
                }
                _ => {}
            }
        }
        Ok(chains)
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()> {
        let lines = rules
            .iter()
            .map(|r| format!("-A {} {}", chain, r))
            .collect();
        self.restore_lines(table, lines)
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()> {
        let lines = rules
            .iter()
            .enumerate()
            .map(|(i, r)| format!("-I {} {} {}", chain, position + i, r))
            .collect();
        self.restore_lines(table, lines)
    }

    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()> {
        self.restore(script, false)
    }

    fn rule_count(&self, table: &str) -> IpTablesResult<usize> {
        let output = Command::new(&self.save)
            .args(["-t", table])
            .output()
            .map_err(IpTablesError::Io)?;

        if !output.status.success() {
            return Err(IpTablesError::Command {
                cmd: format!("{} -t {}", self.save, table),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.starts_with("-A "))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_surfaces_io_error() {
        let ipt = CommandIpTables::new(
            "/nonexistent/iptables",
            "/nonexistent/iptables-restore",
            "/nonexistent/iptables-save",
        );
        assert!(matches!(
            ipt.new_chain("filter", "netout--abc"),
            Err(IpTablesError::Io(_))
        ));
        assert!(matches!(
            ipt.bulk_append("filter", "netout--abc", &[IpTablesRule::new(&["-j", "ACCEPT"])]),
            Err(IpTablesError::Io(_))
        ));
    }

    #[test]
    fn test_empty_bulk_edit_is_a_no_op() {
        let ipt = CommandIpTables::new(
            "/nonexistent/iptables",
            "/nonexistent/iptables-restore",
            "/nonexistent/iptables-save",
        );
        assert!(ipt.bulk_append("filter", "netout--abc", &[]).is_ok());
        assert!(ipt.bulk_insert("filter", "netout--abc", 1, &[]).is_ok());
    }
}
