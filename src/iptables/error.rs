use std::fmt;

/// Error type for every packet-filter operation
#[derive(Debug)]
pub enum IpTablesError {
    /// System I/O error (spawning iptables, opening the lock file)
    Io(std::io::Error),
    /// iptables / iptables-restore exited non-zero
    Command { cmd: String, stderr: String },
    /// Could not take the inter-process lock
    Lock(String),
    /// The operation failed and releasing the lock failed as well
    Unlock { op: Box<IpTablesError>, unlock: String },
    /// Chain-level precondition failed (missing chain, chain in use, ...)
    Chain(String),
    /// Rule-level precondition failed (rule not found, bad position, ...)
    Rule(String),
    /// Chain name exceeds the packet filter's budget
    Name(String),
    /// Output from the packet filter could not be parsed
    Parse(String),
}

impl fmt::Display for IpTablesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpTablesError::Io(e) => write!(f, "io error: {}", e),
            IpTablesError::Command { cmd, stderr } => {
                write!(f, "command '{}' failed: {}", cmd, stderr.trim())
            }
            IpTablesError::Lock(msg) => write!(f, "lock: {}", msg),
            IpTablesError::Unlock { op, unlock } => write!(f, "{}, unlock: {}", op, unlock),
            IpTablesError::Chain(msg) => write!(f, "chain: {}", msg),
            IpTablesError::Rule(msg) => write!(f, "rule: {}", msg),
            IpTablesError::Name(msg) => write!(f, "chain name: {}", msg),
            IpTablesError::Parse(msg) => write!(f, "parse: {}", msg),
        }
    }
}

impl std::error::Error for IpTablesError {}

impl From<std::io::Error> for IpTablesError {
    fn from(e: std::io::Error) -> Self {
        IpTablesError::Io(e)
    }
}

pub type IpTablesResult<T> = Result<T, IpTablesError>;
