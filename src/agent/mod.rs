// Per-host reconciliation agent - polls the policy service and converges
// the C2C and ASG generation chains onto the host's filter table.

pub mod asg;
pub mod config;
pub mod control;
pub mod debug;
pub mod enforcer;
pub mod error;
pub mod log_state;
pub mod metrics;
pub mod planner;
pub mod policy_client;
pub mod poller;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use log_state::LogState;
pub use metrics::Metrics;
pub use poller::Reconciler;

use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Bind `address` and serve `router` until `shutdown` resolves.
pub async fn serve(
    name: &'static str,
    address: String,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address.as_str()).await?;
    info!(server = name, address = %listener.local_addr()?, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
