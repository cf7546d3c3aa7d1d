use serde::{Deserialize, Serialize};
use std::fmt;

/// External identifier: a ULID string, lexicographically sortable by
/// creation time. Stable across renumbering of row ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Eid(String);

impl Eid {
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Eid {
    fn from(s: &str) -> Self {
        Eid(s.to_string())
    }
}

impl From<String> for Eid {
    fn from(s: String) -> Self {
        Eid(s)
    }
}
