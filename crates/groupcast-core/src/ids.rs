//! Connection identity.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-connection identifier.
///
/// Freshly minted ids are UUID v7 strings, so they sort by creation time.
/// Any string is accepted on the wire; clients echo back whatever the
/// server assigned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The full id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading eight characters (or the whole id if shorter).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for ConnectionId {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ConnectionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for ConnectionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_v7_and_distinct() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        let parsed = Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = ConnectionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(ConnectionId::new() > first);
    }

    #[test]
    fn short_handles_tiny_ids() {
        assert_eq!(ConnectionId::from("0123456789abcdef").short(), "01234567");
        assert_eq!(ConnectionId::from("xyz").short(), "xyz");
    }

    #[test]
    fn wire_form_is_the_bare_string() {
        let id = ConnectionId::from("peer-9");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("peer-9"));
        assert_eq!(id.to_string(), "peer-9");
        let back: ConnectionId = serde_json::from_str("\"peer-9\"").unwrap();
        assert_eq!(back, id);
    }
}
