//! Per-session statistics.

use serde::{Deserialize, Serialize};

/// Counters describing what a session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    pub entity_loads: u64,
    pub collection_recreates: u64,
    pub collection_updates: u64,
    pub collection_removes: u64,
    pub collection_loads: u64,
    pub flushes: u64,
    pub optimistic_failures: u64,
    pub statements: u64,
    pub batches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
}

impl SessionStatistics {
    /// Serialize for logging or diagnostics endpoints.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_every_counter() {
        let stats = SessionStatistics {
            entity_inserts: 2,
            flushes: 1,
            ..SessionStatistics::default()
        };
        let json = stats.to_json();
        assert_eq!(json["entity_inserts"], 2);
        assert_eq!(json["flushes"], 1);
        assert_eq!(json["optimistic_failures"], 0);
    }
}
