use crate::iptables::error::{IpTablesError, IpTablesResult};

/// iptables rejects chain names longer than this
pub const MAX_CHAIN_NAME_LENGTH: usize = 28;

/// Deterministic, length-bounded chain names derived from container handles.
#[derive(Debug, Clone, Copy)]
pub struct ChainNamer {
    max_length: usize,
}

impl Default for ChainNamer {
    fn default() -> Self {
        Self {
            max_length: MAX_CHAIN_NAME_LENGTH,
        }
    }
}

impl ChainNamer {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// `<prefix>--<handle>`, cut to the name budget
    pub fn prefix(&self, prefix: &str, handle: &str) -> String {
        let name = format!("{}--{}", prefix, handle);
        truncate(&name, self.max_length).to_string()
    }

    /// `<body>--<suffix>`, cutting the body so the whole name fits
    pub fn postfix(&self, body: &str, suffix: &str) -> IpTablesResult<String> {
        let tail = format!("--{}", suffix);
        if tail.len() > self.max_length {
            return Err(IpTablesError::Name(format!(
                "suffix '{}' exceeds {} characters",
                suffix, self.max_length
            )));
        }
        let body = truncate(body, self.max_length - tail.len());
        Ok(format!("{}{}", body, tail))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
