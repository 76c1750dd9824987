// netwarden-agent - per-host reconciliation daemon
// Polls the policy service and converges C2C and ASG chains until signalled.

use clap::Parser;
use netwarden::agent::debug::LogLevelSetter;
use netwarden::agent::policy_client::{HttpPolicyServiceClient, PolicyServiceClient};
use netwarden::agent::{self, control, debug, metrics, poller};
use netwarden::agent::{AgentConfig, AgentError, LogState, Metrics, Reconciler};
use netwarden::cni::interfaces::{resolve_underlays, NetlinkInterfaceLookup};
use netwarden::iptables::{CommandIpTables, FileLocker, IpTables, LockedIpTables};
use netwarden::utils::constants::DEFAULT_AGENT_CONFIG_PATH;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// netwarden-agent - keeps container packet-filter policy in sync
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-host container network policy agent")]
struct AgentCli {
    /// Path to the agent's JSON configuration
    #[clap(long, env = "NETWARDEN_AGENT_CONFIG", default_value = DEFAULT_AGENT_CONFIG_PATH)]
    config_file: PathBuf,
}

/// Install the global subscriber and hand back a setter for the debug server
fn init_logging(config: &AgentConfig) -> LogLevelSetter {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(config.log_json.then(|| fmt::layer().json().with_target(false)))
        .with((!config.log_json).then(|| fmt::layer().with_target(false).with_ansi(false)))
        .init();

    Arc::new(move |level: &str| {
        let filter = EnvFilter::try_new(level).map_err(|e| format!("invalid level {}: {}", level, e))?;
        handle.reload(filter).map_err(|e| e.to_string())
    })
}

/// Resolves on SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "installing SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn stopped(mut rx: watch::Receiver<bool>) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let set_log_level = init_logging(&config);
    info!(
        policy_server = %config.policy_server_url,
        asgs = config.enable_asg_syncing,
        "starting netwarden-agent"
    );

    let locker = FileLocker::new(&config.iptables_lock_file);
    let ipt = Arc::new(LockedIpTables::new(
        Box::new(CommandIpTables::default()),
        Box::new(locker),
    ));

    let client = Arc::new(HttpPolicyServiceClient::new(
        &config.policy_server_url,
        &config.client_cert_file,
        &config.client_key_file,
        &config.ca_cert_file,
        config.client_timeout(),
    )?);
    match client.healthcheck().await {
        Ok(true) => info!("policy service healthy"),
        Ok(false) => warn!("policy service reports unhealthy"),
        Err(e) => warn!(error = %e, "policy service health check failed"),
    }

    let underlays = resolve_underlays(
        &NetlinkInterfaceLookup,
        &config.temporary_underlay_interface_names,
        &config.underlay_ips,
    )
    .await
    .map_err(AgentError::Underlay)?;
    info!(underlays = ?underlays, "resolved underlay interfaces");

    let log_state = Arc::new(LogState::new(config.iptables_c2c_logging));
    let metrics = Arc::new(Metrics::new());
    let reconciler = Arc::new(Reconciler::new(
        &config,
        ipt.clone(),
        client,
        underlays,
        log_state.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_server = tokio::spawn(agent::serve(
        "control",
        config.control_address(),
        control::router(reconciler.clone()),
        stopped(shutdown_rx.clone()),
    ));
    let debug_server = tokio::spawn(agent::serve(
        "debug",
        config.debug_address(),
        debug::router(log_state, set_log_level),
        stopped(shutdown_rx.clone()),
    ));
    let metrics_task = tokio::spawn(metrics::emit_forever(
        metrics,
        ipt as Arc<dyn IpTables>,
        Duration::from_secs(config.metrics_interval),
    ));

    poller::run(
        reconciler,
        Duration::from_secs(config.poll_interval),
        Duration::from_secs(config.asg_poll_interval),
        wait_for_signal(),
    )
    .await;

    let _ = shutdown_tx.send(true);
    metrics_task.abort();
    for (name, server) in [("control", control_server), ("debug", debug_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "server failed"),
            Err(e) => error!(server = name, error = %e, "server task panicked"),
        }
    }
    info!("netwarden-agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = AgentCli::parse();

    let config = match AgentConfig::load(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("netwarden-agent: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "netwarden-agent failed");
        std::process::exit(1);
    }
}
