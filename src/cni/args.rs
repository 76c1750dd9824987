use crate::cni::error::{PluginError, PluginResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

/// The `CNI_*` environment of one invocation, kept explicit so it can be
/// handed to the delegate verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniArgs {
    pub command: Command,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub path: String,
    pub args: String,
}

impl CniArgs {
    pub fn from_env() -> PluginResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PluginResult<Self> {
        let get = |key: &str| lookup(key).unwrap_or_default();
        let require = |key: &'static str| -> PluginResult<String> {
            match lookup(key) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(PluginError::MissingEnv(key)),
            }
        };

        let command = match require("CNI_COMMAND")?.as_str() {
            "ADD" => Command::Add,
            "DEL" => Command::Del,
            "CHECK" => Command::Check,
            "VERSION" => Command::Version,
            other => return Err(PluginError::UnknownCommand(other.to_string())),
        };

        if command == Command::Version {
            return Ok(Self {
                command,
                container_id: String::new(),
                netns: String::new(),
                ifname: String::new(),
                path: get("CNI_PATH"),
                args: String::new(),
            });
        }

        let container_id = require("CNI_CONTAINERID")?;
        let ifname = require("CNI_IFNAME")?;
        let path = require("CNI_PATH")?;
        // netns may already be gone by the time DEL runs
        let netns = match command {
            Command::Del => get("CNI_NETNS"),
            _ => require("CNI_NETNS")?,
        };

        Ok(Self {
            command,
            container_id,
            netns,
            ifname,
            path,
            args: get("CNI_ARGS"),
        })
    }

    pub fn command_name(&self) -> &'static str {
        match self.command {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        }
    }

    /// Environment for a child plugin running `command`
    pub fn env_for(&self, command: Command) -> Vec<(String, String)> {
        let mut child = self.clone();
        child.command = command;
        vec![
            ("CNI_COMMAND".to_string(), child.command_name().to_string()),
            ("CNI_CONTAINERID".to_string(), child.container_id),
            ("CNI_NETNS".to_string(), child.netns),
            ("CNI_IFNAME".to_string(), child.ifname),
            ("CNI_PATH".to_string(), child.path),
            ("CNI_ARGS".to_string(), child.args),
        ]
    }
}
