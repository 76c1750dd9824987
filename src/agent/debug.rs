//! Debug endpoint: runtime toggles that do not warrant a restart.

use crate::agent::log_state::LogState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Swaps the process-wide log filter; errors describe the rejected level.
pub type LogLevelSetter = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct DebugState {
    log_state: Arc<LogState>,
    set_log_level: LogLevelSetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingToggle {
    pub enabled: bool,
}

pub fn router(log_state: Arc<LogState>, set_log_level: LogLevelSetter) -> Router {
    Router::new()
        .route("/iptables-c2c-logging", get(get_logging).put(put_logging))
        .route("/log-level", post(post_log_level))
        .with_state(DebugState {
            log_state,
            set_log_level,
        })
}

async fn get_logging(State(state): State<DebugState>) -> Json<LoggingToggle> {
    Json(LoggingToggle {
        enabled: state.log_state.enabled(),
    })
}

async fn put_logging(
    State(state): State<DebugState>,
    Json(toggle): Json<LoggingToggle>,
) -> Json<LoggingToggle> {
    state.log_state.set(toggle.enabled);
    info!(enabled = toggle.enabled, "c2c logging toggled");
    Json(toggle)
}

async fn post_log_level(State(state): State<DebugState>, body: String) -> (StatusCode, String) {
    let level = body.trim();
    match (state.set_log_level)(level) {
        Ok(()) => {
            info!(level, "log level changed");
            (StatusCode::OK, String::new())
        }
        Err(e) => {
            warn!(level, error = %e, "rejected log level");
            (StatusCode::BAD_REQUEST, e)
        }
    }
}
