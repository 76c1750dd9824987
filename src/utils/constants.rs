//! Unified constants module for netwarden
//!
//! Chain prefixes are bit-exact: orchestrator tooling matches on them to find
//! orphaned state after a host restart.

// ============================================================================
// Chain Prefixes
// ============================================================================

pub const INPUT_CHAIN_PREFIX: &str = "input";
pub const NETOUT_CHAIN_PREFIX: &str = "netout";
pub const OVERLAY_CHAIN_PREFIX: &str = "overlay";
pub const NETIN_CHAIN_PREFIX: &str = "netin";

/// Suffix of the free-standing accept-logging chain
pub const LOG_CHAIN_SUFFIX: &str = "log";

/// Suffix of the outbound rate-limit logging chain
pub const RATE_LIMIT_LOG_CHAIN_SUFFIX: &str = "rl-log";

/// Prefix of per-container dynamic security-group generation chains
pub const ASG_CHAIN_PREFIX: &str = "asg-";

/// Hex characters of SHA-256(handle) used in ASG chain prefixes
pub const ASG_HANDLE_HASH_LENGTH: usize = 6;

// ============================================================================
// Plugin Exit Codes
// ============================================================================

/// A required CNI_* environment variable is missing
pub const CODE_MISSING_ENV: u32 = 4;

/// Everything else
pub const CODE_PLUGIN_ERROR: u32 = 999;

// ============================================================================
// Policy Agent Control Paths
// ============================================================================

pub const FORCE_POLICY_POLL_PATH: &str = "/force-policy-poll-cycle";
pub const FORCE_ASGS_PATH: &str = "/force-asgs-for-container";
pub const FORCE_ORPHANED_ASGS_CLEANUP_PATH: &str = "/force-orphaned-asgs-cleanup";

// ============================================================================
// Policy Service Paths
// ============================================================================

pub const POLICIES_PATH: &str = "/networking/v1/internal/policies";
pub const TAGS_PATH: &str = "/networking/v1/internal/tags";
pub const SECURITY_GROUPS_PATH: &str = "/networking/v1/internal/security_groups";
pub const HEALTHCHECK_PATH: &str = "/networking/v1/internal/healthcheck";

/// Identity under which the ingress router's tag is allocated
pub const INGRESS_ROUTER_ID: &str = "INGRESS_ROUTER";
pub const INGRESS_ROUTER_TYPE: &str = "router";

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_CNI_VERSION: &str = "1.0.0";
pub const DEFAULT_AGENT_CONFIG_PATH: &str = "/var/vcap/jobs/netwarden-agent/config/agent.json";
pub const DEFAULT_POLICY_CHAIN_PREFIX: &str = "vpa--";
