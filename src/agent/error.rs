use crate::agent::policy_client::PolicyClientError;
use crate::datastore::StoreError;
use crate::iptables::IpTablesError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("reading datastore: {0}")]
    Store(#[from] StoreError),

    #[error("policy service: {0}")]
    PolicyService(#[from] PolicyClientError),

    #[error("enforcing {chain}: {source}")]
    Enforce {
        chain: String,
        #[source]
        source: IpTablesError,
    },

    #[error("invalid managed chain pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("looking up underlay interfaces: {0}")]
    Underlay(String),

    #[error("security group {group}: {message}")]
    SecurityGroup { group: String, message: String },

    #[error("{failed} of {total} containers failed")]
    Partial { failed: usize, total: usize },

    #[error("dynamic asgs are disabled")]
    AsgsDisabled,
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn enforce(chain: impl Into<String>, source: IpTablesError) -> Self {
        AgentError::Enforce {
            chain: chain.into(),
            source,
        }
    }
}
