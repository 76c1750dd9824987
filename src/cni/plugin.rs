use crate::cni::args::{CniArgs, Command};
use crate::cni::chains::{masquerade_rule, remove_chain, ChainNames, ChainSpec, Fabric};
use crate::cni::config::WrapperConfig;
use crate::cni::delegate::Delegator;
use crate::cni::error::{PluginError, PluginResult};
use crate::cni::interfaces::{resolve_underlays, InterfaceNameLookup};
use crate::cni::poke::PolicyAgentClient;
use crate::cni::result::CniResult;
use crate::datastore::{Store, StoreError};
use crate::iptables::{split_rule_line, ChainNamer, IpTables, LockedIpTables, FILTER, NAT};
use tracing::{debug, error, info, warn};

/// What the install engine has done so far; undone in reverse on failure.
#[derive(Default)]
struct Progress {
    masquerade: Option<String>,
    stored: bool,
    chains: Vec<ChainSpec>,
}

/// Install / tear-down engine for one host.
pub struct Plugin {
    ipt: LockedIpTables,
    store: Store,
    delegator: Box<dyn Delegator>,
    lookup: Box<dyn InterfaceNameLookup>,
    agent: Box<dyn PolicyAgentClient>,
    namer: ChainNamer,
}

impl Plugin {
    pub fn new(
        ipt: LockedIpTables,
        store: Store,
        delegator: Box<dyn Delegator>,
        lookup: Box<dyn InterfaceNameLookup>,
        agent: Box<dyn PolicyAgentClient>,
    ) -> Self {
        Self {
            ipt,
            store,
            delegator,
            lookup,
            agent,
            namer: ChainNamer::default(),
        }
    }

    /// ADD: returns the CNI result document to print.
    pub async fn add(&self, args: &CniArgs, config: &WrapperConfig) -> PluginResult<String> {
        config.validate()?;
        let handle = args.container_id.as_str();
        if handle.is_empty() {
            return Err(PluginError::Store(StoreError::InvalidHandle));
        }
        // Store::add re-checks under the exclusive lock; this only spares the delegate call
        if self.store.contains(handle)? {
            return Err(PluginError::AlreadyExists(handle.to_string()));
        }

        let plugin_type = config
            .delegate
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let raw = self
            .delegator
            .delegate(Command::Add, &plugin_type, &config.delegate_bytes()?, args)
            .await
            .map_err(PluginError::Delegate)?;
        let mut result =
            CniResult::parse(&raw).map_err(PluginError::DelegateResult)?;
        let container_ip = result
            .first_ip()
            .ok_or_else(|| PluginError::DelegateResult("no ip in delegate result".to_string()))?;

        let mut progress = Progress::default();
        if let Err(e) = self
            .install(args, config, &container_ip, &mut progress)
            .await
        {
            error!(handle, error = %e, "add failed, rolling back");
            self.rollback(handle, config, progress);
            return Err(e);
        }

        info!(handle, ip = %container_ip, "container network installed");
        result
            .dns
            .nameservers
            .extend(config.dns_servers.iter().cloned());
        let encoded = result
            .encode(&config.cni_version)
            .map_err(PluginError::DelegateResult)?;
        Ok(encoded.to_string())
    }

    async fn install(
        &self,
        args: &CniArgs,
        config: &WrapperConfig,
        container_ip: &str,
        progress: &mut Progress,
    ) -> PluginResult<()> {
        let handle = args.container_id.as_str();

        let masq = masquerade_rule(config, container_ip);
        self.ipt
            .append(NAT, "POSTROUTING", &masq)
            .map_err(|e| PluginError::iptables("adding ip masquerade", e))?;
        progress.masquerade = Some(container_ip.to_string());

        self.store
            .add(handle, container_ip, config.metadata.clone())
            .map_err(|e| match e {
                StoreError::Duplicate(handle) => PluginError::AlreadyExists(handle),
                e => PluginError::StoreAdd(e),
            })?;
        progress.stored = true;

        let poll = self
            .agent
            .force_policy_poll()
            .await
            .map_err(PluginError::PolicyAgent)?;
        if poll.status != 200 {
            return Err(PluginError::ForcePoll {
                code: poll.status,
                body: poll.body,
            });
        }

        let underlays = resolve_underlays(
            self.lookup.as_ref(),
            &config.temporary_underlay_interface_names,
            &config.underlay_ips,
        )
        .await
        .map_err(PluginError::Underlay)?;

        let fabric = Fabric::new(config, &self.namer, handle, container_ip, &underlays)
            .map_err(|e| PluginError::iptables("naming chains", e))?;
        let chains = fabric
            .chains()
            .map_err(|e| PluginError::iptables("building rules", e))?;
        for chain in chains {
            let installed = self.ipt.locked(|ipt| chain.install(ipt));
            // a chain that failed halfway may exist already, so it is rolled back too
            let name = chain.name.clone();
            progress.chains.push(chain);
            installed.map_err(|e| PluginError::iptables(format!("installing chain {}", name), e))?;
            debug!(handle, chain = %name, "installed chain");
        }

        let asgs = self
            .agent
            .force_asgs_for_container(handle)
            .await
            .map_err(PluginError::PolicyAgent)?;
        match asgs.status {
            200 => {}
            405 => {
                let app_rules = fabric.app_rules();
                self.ipt
                    .bulk_insert(
                        FILTER,
                        &fabric.names().net_out,
                        fabric.app_rules_position(),
                        &app_rules,
                    )
                    .map_err(|e| PluginError::iptables("inserting net out rules", e))?;
                debug!(handle, count = app_rules.len(), "installed static egress rules");
            }
            code => {
                return Err(PluginError::AsgSync {
                    code,
                    body: asgs.body,
                })
            }
        }
        Ok(())
    }

    fn rollback(&self, handle: &str, config: &WrapperConfig, progress: Progress) {
        for chain in progress.chains.iter().rev() {
            if let Err(e) = self
                .ipt
                .locked(|ipt| remove_chain(ipt, chain.table, chain.parent_chain, &chain.name))
            {
                warn!(handle, chain = %chain.name, error = %e, "rollback: removing chain");
            }
        }
        if progress.stored {
            if let Err(e) = self.store.delete(handle) {
                warn!(handle, error = %e, "rollback: removing datastore entry");
            }
        }
        if let Some(ip) = progress.masquerade {
            if let Err(e) = self.remove_masquerade(config, &ip) {
                warn!(handle, error = %e, "rollback");
            }
        }
    }

    /// Delete the masquerade rule for `container_ip` if it is installed
    fn remove_masquerade(&self, config: &WrapperConfig, container_ip: &str) -> PluginResult<()> {
        let rule = masquerade_rule(config, container_ip);
        self.ipt
            .locked(|ipt| {
                if ipt.exists(NAT, "POSTROUTING", &rule)? {
                    ipt.delete(NAT, "POSTROUTING", &rule)?;
                }
                Ok(())
            })
            .map_err(|e| PluginError::iptables("removing ip masquerade", e))
    }

    /// Container IP taken from the `-s <ip>/32` jump into its input chain
    fn installed_ip(&self, names: &ChainNames) -> Option<String> {
        let lines = match self.ipt.list(FILTER, "INPUT") {
            Ok(lines) => lines,
            Err(e) => {
                warn!(chain = %names.input, error = %e, "listing INPUT");
                return None;
            }
        };
        lines.iter().find_map(|line| {
            let args = split_rule_line(line);
            if args.last() != Some(&names.input) {
                return None;
            }
            let source = args.iter().position(|a| a == "-s")?;
            args.get(source + 1)
                .map(|ip| ip.trim_end_matches("/32").to_string())
        })
    }

    /// DEL: idempotent; only a failed orphan-cleanup poke is reported.
    pub async fn del(&self, args: &CniArgs, config: &WrapperConfig) -> PluginResult<()> {
        let handle = args.container_id.as_str();

        let (removed, store_failed) = match self.store.delete(handle) {
            Ok(removed) => (removed, false),
            Err(e) => {
                warn!(handle, error = %e, "removing datastore entry");
                (None, true)
            }
        };
        let names = match ChainNames::new(&self.namer, handle) {
            Ok(names) => Some(names),
            Err(e) => {
                warn!(handle, error = %e, "naming chains");
                None
            }
        };
        // without a record the input chain jump is the last place the ip is known
        let container_ip = match removed {
            Some(container) => Some(container.ip),
            None => names.as_ref().and_then(|names| self.installed_ip(names)),
        };

        let plugin_type = config
            .delegate
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        match config.delegate_bytes() {
            Ok(bytes) => {
                if let Err(e) = self
                    .delegator
                    .delegate(Command::Del, &plugin_type, &bytes, args)
                    .await
                {
                    warn!(handle, error = %e, "delegate del");
                }
            }
            Err(e) => warn!(handle, error = %e, "encoding delegate config"),
        }

        if let Some(names) = &names {
            for (table, parent, chain) in names.teardown_order() {
                if let Err(e) = self
                    .ipt
                    .locked(|ipt| remove_chain(ipt, table, parent, chain))
                {
                    warn!(handle, table, chain, error = %e, "removing chain");
                }
            }
        }

        match container_ip {
            Some(ip) => {
                if let Err(e) = self.remove_masquerade(config, &ip) {
                    warn!(handle, ip = %ip, error = %e, "del");
                }
            }
            None if store_failed => {
                warn!(handle, "container ip unknown, any ip masquerade rule for it is left in place")
            }
            None => debug!(handle, "no datastore entry, skipping ip masquerade"),
        }

        let cleanup = self
            .agent
            .force_orphaned_asgs_cleanup(handle)
            .await
            .map_err(PluginError::PolicyAgent)?;
        match cleanup.status {
            200 | 405 => {
                info!(handle, "container network removed");
                Ok(())
            }
            code => Err(PluginError::AsgCleanup {
                code,
                body: cleanup.body,
            }),
        }
    }

    /// CHECK is accepted without inspecting state.
    pub async fn check(&self, args: &CniArgs, _config: &WrapperConfig) -> PluginResult<()> {
        debug!(handle = %args.container_id, "check");
        Ok(())
    }
}
