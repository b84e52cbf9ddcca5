use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quota::Plan;

/// Opaque caller identifier supplied by the transport. Not verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub const ANONYMOUS: &'static str = "anon";

    /// Blank ids collapse to the anonymous caller.
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            Self(Self::ANONYMOUS.to_string())
        } else {
            Self(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(prefix)
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is asking, as resolved from one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: CallerId,
    /// Plan the caller claims. The quota ledger may override it.
    pub plan: Plan,
    /// Rate-limit key, usually the client address.
    pub origin: String,
}

impl Caller {
    pub fn new(id: &str, plan: Plan, origin: impl Into<String>) -> Self {
        Self {
            id: CallerId::new(id),
            plan,
            origin: origin.into(),
        }
    }
}
