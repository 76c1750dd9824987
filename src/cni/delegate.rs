use crate::cni::args::{CniArgs, Command};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Invokes the upstream IP-allocation plugin.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Run the plugin named by `plugin_type` with `config` on stdin; returns its stdout.
    async fn delegate(
        &self,
        command: Command,
        plugin_type: &str,
        config: &[u8],
        args: &CniArgs,
    ) -> Result<Vec<u8>, String>;
}

/// Finds the plugin binary on `CNI_PATH` and executes it as a child process.
pub struct ExecDelegator;

impl ExecDelegator {
    fn find_plugin(plugin_type: &str, cni_path: &str) -> Result<PathBuf, String> {
        cni_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join(plugin_type))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| format!("failed to find plugin \"{}\" in path [{}]", plugin_type, cni_path))
    }
}

#[async_trait]
impl Delegator for ExecDelegator {
    async fn delegate(
        &self,
        command: Command,
        plugin_type: &str,
        config: &[u8],
        args: &CniArgs,
    ) -> Result<Vec<u8>, String> {
        let binary = Self::find_plugin(plugin_type, &args.path)?;

        let mut child = tokio::process::Command::new(&binary)
            .envs(args.env_for(command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| format!("spawn {}: {}", binary.display(), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(config)
                .await
                .map_err(|e| format!("write stdin: {}", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("wait {}: {}", binary.display(), e))?;

        if !output.status.success() {
            return Err(plugin_error_message(&output.stdout)
                .unwrap_or_else(|| format!("{} exited with {}", plugin_type, output.status)));
        }
        Ok(output.stdout)
    }
}

/// Pull `msg` (and `details`) out of a plugin's JSON error document.
fn plugin_error_message(stdout: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    let msg = value.get("msg")?.as_str()?.to_string();
    match value.get("details").and_then(|d| d.as_str()) {
        Some(details) if !details.is_empty() => Some(format!("{}; {}", msg, details)),
        _ => Some(msg),
    }
}
