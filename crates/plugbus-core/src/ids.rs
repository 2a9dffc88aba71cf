use std::fmt;

use uuid::Uuid;

/// Transport-owned handle for one accepted socket. The broker only uses it
/// as a routing token.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Time-ordered, so ids sort by accept order in logs.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_connection_gets_a_fresh_id() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn display_is_prefixed() {
        let shown = ConnectionId::new().to_string();
        assert!(shown.starts_with("conn-"), "got: {shown}");
        assert_eq!(shown.len(), "conn-".len() + 32);
    }
}
