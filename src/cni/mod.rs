// Install / tear-down engine invoked by the container-network plugin pipeline.
// One process per container event; stdout carries the CNI result or error document.

pub mod args;
pub mod chains;
pub mod config;
pub mod delegate;
pub mod error;
pub mod interfaces;
pub mod plugin;
pub mod poke;
pub mod result;

pub use args::{CniArgs, Command};
pub use config::WrapperConfig;
pub use error::{PluginError, PluginResult};
pub use plugin::Plugin;

use crate::datastore::Store;
use crate::iptables::{CommandIpTables, FileLocker, LockedIpTables};
use crate::utils::constants::DEFAULT_CNI_VERSION;
use delegate::ExecDelegator;
use interfaces::NetlinkInterfaceLookup;
use poke::HttpPolicyAgentClient;
use result::SUPPORTED_VERSIONS;

impl Plugin {
    /// Wire the production collaborators named by the wrapper configuration.
    pub fn from_config(config: &WrapperConfig) -> PluginResult<Self> {
        let locker = FileLocker::new(&config.iptables_lock_file)
            .with_owner(&config.datastore_file_owner, &config.datastore_file_group);
        let ipt = LockedIpTables::new(Box::new(CommandIpTables::default()), Box::new(locker));
        let store = Store::new(&config.datastore)
            .with_owner(&config.datastore_file_owner, &config.datastore_file_group);
        let agent = HttpPolicyAgentClient::new(&config.policy_agent_force_poll_address)
            .map_err(PluginError::PolicyAgent)?;

        Ok(Plugin::new(
            ipt,
            store,
            Box::new(ExecDelegator),
            Box::new(NetlinkInterfaceLookup),
            Box::new(agent),
        ))
    }
}

/// `VERSION` answer: the versions this plugin can encode results in
pub fn version_info() -> String {
    serde_json::json!({
        "cniVersion": DEFAULT_CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
    .to_string()
}

/// Execute one invocation. Returns what should be printed on stdout, if anything.
pub async fn run(args: &CniArgs, stdin: &[u8]) -> PluginResult<Option<String>> {
    if args.command == Command::Version {
        return Ok(Some(version_info()));
    }

    let config = WrapperConfig::parse(stdin)?;
    let plugin = Plugin::from_config(&config)?;
    tracing::debug!(
        command = args.command_name(),
        handle = %args.container_id,
        "cni invocation"
    );

    match args.command {
        Command::Add => plugin.add(args, &config).await.map(Some),
        Command::Del => plugin.del(args, &config).await.map(|()| None),
        Command::Check => plugin.check(args, &config).await.map(|()| None),
        Command::Version => Ok(Some(version_info())),
    }
}
