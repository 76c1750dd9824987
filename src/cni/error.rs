use crate::datastore::StoreError;
use crate::iptables::IpTablesError;
use crate::utils::constants::{CODE_MISSING_ENV, CODE_PLUGIN_ERROR};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("required env variable {0} is missing")]
    MissingEnv(&'static str),

    #[error("unknown CNI_COMMAND: {0}")]
    UnknownCommand(String),

    #[error("loading config: {0}")]
    Decode(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("delegate call: {0}")]
    Delegate(String),

    #[error("delegate result: {0}")]
    DelegateResult(String),

    #[error("store add: {0}")]
    StoreAdd(StoreError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("vpa response code: {code} with message: {body}")]
    ForcePoll { code: u16, body: String },

    #[error("asg sync returned {code} with message: {body}")]
    AsgSync { code: u16, body: String },

    #[error("asg cleanup returned {code} with message: {body}")]
    AsgCleanup { code: u16, body: String },

    #[error("policy agent request: {0}")]
    PolicyAgent(String),

    #[error("looking up underlay interfaces: {0}")]
    Underlay(String),

    #[error("adding netin rule: {0}")]
    NetIn(String),

    #[error("{context}: {source}")]
    IpTables {
        context: String,
        #[source]
        source: IpTablesError,
    },
}

pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    pub fn iptables(context: impl Into<String>, source: IpTablesError) -> Self {
        PluginError::IpTables {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            PluginError::MissingEnv(_) => CODE_MISSING_ENV,
            _ => CODE_PLUGIN_ERROR,
        }
    }

    /// `{"code": <int>, "msg": <string>}` as written to stdout on failure
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            code: u32,
            msg: &'a str,
        }

        let msg = self.to_string();
        serde_json::to_string(&ErrorBody {
            code: self.code(),
            msg: &msg,
        })
        .unwrap_or_else(|_| format!("{{\"code\":{},\"msg\":\"internal error\"}}", self.code()))
    }
}
