//! Loopback control endpoint poked by the CNI plugin around container
//! lifecycle events.

use crate::agent::error::{AgentError, AgentResult};
use crate::agent::poller::Reconciler;
use crate::utils::constants::{
    FORCE_ASGS_PATH, FORCE_ORPHANED_ASGS_CLEANUP_PATH, FORCE_POLICY_POLL_PATH,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct ContainerQuery {
    container: String,
}

pub fn router(reconciler: Arc<Reconciler>) -> Router {
    Router::new()
        .route(FORCE_POLICY_POLL_PATH, get(force_policy_poll))
        .route(FORCE_ASGS_PATH, get(force_asgs_for_container))
        .route(FORCE_ORPHANED_ASGS_CLEANUP_PATH, get(force_orphaned_asgs_cleanup))
        .with_state(reconciler)
}

/// 200 on success, 405 when dynamic ASGs are off, 500 otherwise
fn respond(what: &str, result: AgentResult<()>) -> (StatusCode, String) {
    match result {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(AgentError::AsgsDisabled) => {
            (StatusCode::METHOD_NOT_ALLOWED, AgentError::AsgsDisabled.to_string())
        }
        Err(e) => {
            error!(error = %e, "{} failed", what);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn force_policy_poll(State(reconciler): State<Arc<Reconciler>>) -> (StatusCode, String) {
    info!("forced c2c poll");
    respond("forced policy poll", reconciler.sync_c2c().await)
}

async fn force_asgs_for_container(
    State(reconciler): State<Arc<Reconciler>>,
    Query(query): Query<ContainerQuery>,
) -> (StatusCode, String) {
    info!(container = %query.container, "forced asg sync");
    respond(
        "forced asg sync",
        reconciler.sync_asgs_for(&query.container).await,
    )
}

async fn force_orphaned_asgs_cleanup(
    State(reconciler): State<Arc<Reconciler>>,
    Query(query): Query<ContainerQuery>,
) -> (StatusCode, String) {
    info!(container = %query.container, "forced orphaned asg cleanup");
    respond(
        "orphaned asg cleanup",
        reconciler.cleanup_orphaned(&query.container).await,
    )
}
