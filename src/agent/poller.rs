//! The reconciliation loop: C2C and ASG ticks, each a planner run followed
//! by one enforcement per generation chain.

use crate::agent::asg::{self, AsgPlanner};
use crate::agent::config::AgentConfig;
use crate::agent::enforcer::{Enforcement, Enforcer, Timestamper};
use crate::agent::error::{AgentError, AgentResult};
use crate::agent::log_state::LogState;
use crate::agent::metrics::Metrics;
use crate::agent::planner::C2cPlanner;
use crate::agent::policy_client::{PolicyServiceClient, SecurityGroup};
use crate::datastore::{Container, Store};
use crate::iptables::{LockedIpTables, FILTER};
use crate::utils::constants::{ASG_CHAIN_PREFIX, ASG_HANDLE_HASH_LENGTH};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Parent of every C2C generation chain
const C2C_PARENT_CHAIN: &str = "FORWARD";

pub struct Reconciler {
    store: Store,
    client: Arc<dyn PolicyServiceClient>,
    c2c_planner: C2cPlanner,
    asg_planner: AsgPlanner,
    c2c_enforcer: Enforcer,
    asg_enforcer: Enforcer,
    log_state: Arc<LogState>,
    metrics: Arc<Metrics>,
    policy_chain_prefix: String,
    asgs_enabled: bool,
    // one planner+enforcer run at a time, whichever surface triggered it
    run: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        config: &AgentConfig,
        ipt: Arc<LockedIpTables>,
        client: Arc<dyn PolicyServiceClient>,
        underlays: Vec<String>,
        log_state: Arc<LogState>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let stamper = Arc::new(Timestamper::new());
        let mut c2c_enforcer = Enforcer::new(ipt.clone(), stamper.clone());
        if config.overlay_allow_all {
            c2c_enforcer = c2c_enforcer.with_overlay_allow_all(&config.overlay_network);
        }

        Self {
            store: Store::new(&config.datastore),
            client,
            c2c_planner: C2cPlanner::new(
                underlays,
                config.enable_overlay_ingress_rules,
                config.iptables_accepted_udp_logs_per_sec,
            ),
            asg_planner: AsgPlanner::new(config),
            c2c_enforcer,
            asg_enforcer: Enforcer::new(ipt, stamper),
            log_state,
            metrics,
            policy_chain_prefix: config.policy_chain_prefix.clone(),
            asgs_enabled: config.enable_asg_syncing,
            run: Mutex::new(()),
        }
    }

    pub fn asgs_enabled(&self) -> bool {
        self.asgs_enabled
    }

    pub fn log_state(&self) -> &Arc<LogState> {
        &self.log_state
    }

    /// Plan and enforce container-to-container policy
    pub async fn sync_c2c(&self) -> AgentResult<()> {
        let _run = self.run.lock().await;
        let started = Instant::now();

        let result = self.enforce_c2c().await;
        self.metrics.record_c2c(started.elapsed(), result.is_ok());
        result
    }

    async fn enforce_c2c(&self) -> AgentResult<()> {
        let rules = self
            .c2c_planner
            .fetch_and_plan(&self.store, self.client.as_ref(), self.log_state.enabled())
            .await?;
        let chain = self.c2c_enforcer.enforce(Enforcement {
            table: FILTER,
            parent_chain: C2C_PARENT_CHAIN,
            chain_prefix: &self.policy_chain_prefix,
            managed_chains: &self.policy_chain_prefix,
            cleanup_parent_chain: false,
            rules,
        })?;
        debug!(chain = %chain, "c2c reconciled");
        Ok(())
    }

    /// Re-enforce security groups for every live container, then delete
    /// generations whose container is gone.
    pub async fn sync_asgs(&self) -> AgentResult<()> {
        if !self.asgs_enabled {
            return Err(AgentError::AsgsDisabled);
        }
        let _run = self.run.lock().await;
        let started = Instant::now();

        let result = self.enforce_all_asgs().await;
        self.metrics.record_asg(started.elapsed(), result.is_ok());
        result
    }

    async fn enforce_all_asgs(&self) -> AgentResult<()> {
        let containers = self.store.read_all()?;
        let groups = self.client.security_groups().await?;

        let mut failed = 0;
        for container in containers.values() {
            if let Err(e) = self.enforce_asgs(container, &groups) {
                warn!(handle = %container.handle, error = %e, "asg enforcement failed");
                failed += 1;
            }
        }

        let live: HashSet<String> = containers.keys().map(|h| asg::handle_hash(h)).collect();
        let swept = self
            .asg_enforcer
            .sweep_unowned(FILTER, ASG_CHAIN_PREFIX, ASG_HANDLE_HASH_LENGTH, &live)?;
        if swept > 0 {
            info!(swept, "removed asg chains of departed containers");
        }

        if failed > 0 {
            return Err(AgentError::Partial {
                failed,
                total: containers.len(),
            });
        }
        Ok(())
    }

    /// Enforce security groups for one container, as asked by the CNI plugin
    /// right after it installs the container's chains.
    pub async fn sync_asgs_for(&self, handle: &str) -> AgentResult<()> {
        if !self.asgs_enabled {
            return Err(AgentError::AsgsDisabled);
        }
        let _run = self.run.lock().await;
        let started = Instant::now();

        let result = self.enforce_asgs_for(handle).await;
        self.metrics.record_asg(started.elapsed(), result.is_ok());
        result
    }

    async fn enforce_asgs_for(&self, handle: &str) -> AgentResult<()> {
        let containers = self.store.read_all()?;
        let Some(container) = containers.get(handle) else {
            debug!(handle, "container not in datastore, nothing to enforce");
            return Ok(());
        };
        let groups = self.client.security_groups().await?;
        self.enforce_asgs(container, &groups)
    }

    fn enforce_asgs(&self, container: &Container, groups: &[SecurityGroup]) -> AgentResult<()> {
        let names = self.asg_planner.names(&container.handle)?;
        let rules = self.asg_planner.ruleset(container, groups)?;
        let prefix = asg::chain_prefix(&container.handle);
        self.asg_enforcer.enforce(Enforcement {
            table: FILTER,
            parent_chain: &names.net_out,
            chain_prefix: &prefix,
            managed_chains: &prefix,
            cleanup_parent_chain: true,
            rules,
        })?;
        Ok(())
    }

    /// Delete every ASG generation of a torn-down container
    pub async fn cleanup_orphaned(&self, handle: &str) -> AgentResult<()> {
        if !self.asgs_enabled {
            return Err(AgentError::AsgsDisabled);
        }
        let _run = self.run.lock().await;

        let names = self.asg_planner.names(handle)?;
        let removed = self.asg_enforcer.remove_generations(
            FILTER,
            &names.net_out,
            &asg::chain_prefix(handle),
        )?;
        debug!(handle, removed, "cleaned up orphaned asg chains");
        Ok(())
    }
}

/// Run both ticks until `shutdown` resolves. A tick in flight when the
/// signal arrives completes before the loop returns.
pub async fn run(
    reconciler: Arc<Reconciler>,
    poll_interval: Duration,
    asg_poll_interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut c2c = tokio::time::interval(poll_interval);
    c2c.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut asgs = tokio::time::interval(asg_poll_interval);
    asgs.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("reconciliation loop stopping");
                return;
            }
            _ = c2c.tick() => {
                if let Err(e) = reconciler.sync_c2c().await {
                    warn!(error = %e, "c2c tick failed, keeping previous generation");
                }
            }
            _ = asgs.tick(), if reconciler.asgs_enabled() => {
                if let Err(e) = reconciler.sync_asgs().await {
                    warn!(error = %e, "asg tick failed");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::config::tests::sample;
    use crate::agent::policy_client::tests::FakePolicyService;
    use crate::agent::policy_client::{Policy, PolicyDestination, PolicySet, PolicySource};
    use crate::iptables::converter::PortRange;
    use crate::iptables::memory::{locked_in_memory, InMemoryIpTables};
    use crate::iptables::{rules, IpTables};
    use serde_json::json;

    pub(crate) struct Fixture {
        pub ipt: Arc<InMemoryIpTables>,
        pub service: Arc<FakePolicyService>,
        pub reconciler: Arc<Reconciler>,
        pub store: Store,
        pub metrics: Arc<Metrics>,
        _dir: tempfile::TempDir,
    }

    pub(crate) fn fixture(asgs: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample();
        config.datastore = dir.path().join("store.json").display().to_string();
        config.enable_asg_syncing = asgs;

        let (ipt, locked) = locked_in_memory();
        let service = Arc::new(FakePolicyService::default());
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(
            &config,
            Arc::new(locked),
            Arc::new(service.clone()),
            vec!["eth0".to_string()],
            Arc::new(LogState::new(false)),
            metrics.clone(),
        );
        Fixture {
            ipt,
            service,
            reconciler: Arc::new(reconciler),
            store: Store::new(&config.datastore),
            metrics,
            _dir: dir,
        }
    }

    pub(crate) fn add_container(f: &Fixture, handle: &str, ip: &str, app: &str) {
        let metadata = json!({"policy_group_id": app, "space_id": "space-1", "container_workload": "app"});
        f.store
            .add(handle, ip, metadata.as_object().cloned().unwrap())
            .unwrap();
    }

    fn c2c_policy() -> PolicySet {
        PolicySet {
            policies: vec![Policy {
                source: PolicySource {
                    id: "app-a".to_string(),
                    tag: "AA".to_string(),
                },
                destination: PolicyDestination {
                    id: "app-b".to_string(),
                    tag: "BB".to_string(),
                    protocol: "tcp".to_string(),
                    ports: PortRange { start: 1234, end: 1234 },
                },
            }],
            ..Default::default()
        }
    }

    fn forward_jumps(ipt: &InMemoryIpTables, prefix: &str) -> Vec<String> {
        ipt.chain_rules(FILTER, "FORWARD")
            .iter()
            .filter_map(|r| r.jump_target().map(str::to_string))
            .filter(|t| t.starts_with(prefix))
            .collect()
    }

    #[tokio::test]
    async fn test_c2c_tick_installs_one_generation() {
        let f = fixture(false);
        add_container(&f, "h1", "10.255.1.2", "app-a");
        add_container(&f, "h2", "10.255.1.3", "app-b");
        *f.service.policies.lock() = c2c_policy();

        f.reconciler.sync_c2c().await.unwrap();
        let jumps = forward_jumps(&f.ipt, "vpa--");
        assert_eq!(jumps.len(), 1);
        assert_eq!(
            f.ipt.chain_rules(FILTER, &jumps[0]),
            vec![
                rules::new_mark_set_rule("10.255.1.2", "AA", "app-a"),
                rules::new_mark_allow_rule("10.255.1.3", "tcp", 1234, 1234, "AA", "app-a", "app-b"),
            ]
        );

        // unchanged input: same rules, still a single newer generation
        let first = f.ipt.chain_rules(FILTER, &jumps[0]);
        f.reconciler.sync_c2c().await.unwrap();
        let again = forward_jumps(&f.ipt, "vpa--");
        assert_eq!(again.len(), 1);
        assert!(again[0] > jumps[0]);
        assert_eq!(f.ipt.chain_rules(FILTER, &again[0]), first);
        assert!(!f.ipt.chain_exists(FILTER, &jumps[0]));
        assert_eq!(f.metrics.snapshot().c2c_ticks, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_generation() {
        let f = fixture(false);
        add_container(&f, "h1", "10.255.1.2", "app-a");
        f.reconciler.sync_c2c().await.unwrap();
        let before = forward_jumps(&f.ipt, "vpa--");

        *f.service.fail.lock() = true;
        let err = f.reconciler.sync_c2c().await.unwrap_err();
        assert!(matches!(err, AgentError::PolicyService(_)));
        assert_eq!(forward_jumps(&f.ipt, "vpa--"), before);
        assert_eq!(f.metrics.snapshot().c2c_failures, 1);
    }

    #[tokio::test]
    async fn test_c2c_logging_follows_log_state() {
        let f = fixture(false);
        add_container(&f, "h1", "10.255.1.2", "app-a");
        add_container(&f, "h2", "10.255.1.3", "app-b");
        *f.service.policies.lock() = c2c_policy();
        f.reconciler.log_state().set(true);

        f.reconciler.sync_c2c().await.unwrap();
        let jumps = forward_jumps(&f.ipt, "vpa--");
        let generation = f.ipt.chain_rules(FILTER, &jumps[0]);
        assert_eq!(generation.len(), 3);
        assert_eq!(generation[1].jump_target(), Some("LOG"));
    }

    fn install_netout(ipt: &InMemoryIpTables, handle: &str) {
        let chain = format!("netout--{}", handle);
        ipt.new_chain(FILTER, &chain).unwrap();
        ipt.append(FILTER, &chain, &rules::new_net_out_default_reject_rule())
            .unwrap();
    }

    fn running_group() -> SecurityGroup {
        SecurityGroup {
            guid: "public".to_string(),
            rules: json!([{"protocol": "all", "destination": "0.0.0.0-255.255.255.255"}]).to_string(),
            running_default: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_asgs_for_one_container() {
        let f = fixture(true);
        add_container(&f, "abc", "10.255.1.2", "app-a");
        install_netout(&f.ipt, "abc");
        f.service.groups.lock().push(running_group());

        f.reconciler.sync_asgs_for("abc").await.unwrap();
        let parent = f.ipt.chain_rules(FILTER, "netout--abc");
        assert_eq!(parent.len(), 1);
        let generation = parent[0].jump_target().unwrap().to_string();
        assert!(generation.starts_with("asg-ba7816"));
        assert!(f
            .ipt
            .chain_rules(FILTER, &generation)
            .contains(&rules::new_net_out_rule("0.0.0.0", "255.255.255.255", rules::Verdict::Accept)));

        // unknown handles are a no-op
        f.reconciler.sync_asgs_for("nope").await.unwrap();

        f.reconciler.cleanup_orphaned("abc").await.unwrap();
        assert!(f.ipt.chain_rules(FILTER, "netout--abc").is_empty());
        assert!(!f.ipt.chain_exists(FILTER, &generation));
    }

    #[tokio::test]
    async fn test_asg_tick_sweeps_departed_containers() {
        let f = fixture(true);
        add_container(&f, "abc", "10.255.1.2", "app-a");
        install_netout(&f.ipt, "abc");
        f.ipt.new_chain(FILTER, "asg-0000001000000000000").unwrap();

        f.reconciler.sync_asgs().await.unwrap();
        assert!(!f.ipt.chain_exists(FILTER, "asg-0000001000000000000"));
        assert_eq!(f.ipt.chain_rules(FILTER, "netout--abc").len(), 1);
        assert_eq!(f.metrics.snapshot().asg_ticks, 1);
    }

    #[tokio::test]
    async fn test_asg_tick_reports_containers_without_chains() {
        let f = fixture(true);
        add_container(&f, "abc", "10.255.1.2", "app-a");
        let err = f.reconciler.sync_asgs().await.unwrap_err();
        assert!(err.to_string().contains("1 of 1 containers failed"));
        assert!(f
            .ipt
            .list_chains(FILTER)
            .unwrap()
            .iter()
            .all(|c| !c.starts_with("asg-")));
    }

    #[tokio::test]
    async fn test_asgs_disabled() {
        let f = fixture(false);
        assert!(matches!(f.reconciler.sync_asgs().await, Err(AgentError::AsgsDisabled)));
        assert!(matches!(
            f.reconciler.sync_asgs_for("abc").await,
            Err(AgentError::AsgsDisabled)
        ));
        assert!(matches!(
            f.reconciler.cleanup_orphaned("abc").await,
            Err(AgentError::AsgsDisabled)
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(false);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(run(
            f.reconciler.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            async move {
                let _ = rx.await;
            },
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(f.metrics.snapshot().c2c_ticks >= 1);
    }
}
