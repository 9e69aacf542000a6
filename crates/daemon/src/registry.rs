//! Peer address registry
//!
//! Maps peer identifiers to their externally visible `host:port` endpoint.
//! A registration for an existing id replaces the old record (last write wins).
//! Records never expire.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// One peer's publicly reachable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: String,
    /// Externally visible UDP endpoint ("ip:port")
    #[serde(default)]
    pub address: String,
}

/// Thread-safe registry shared by all request handlers.
///
/// Every operation takes the single lock for its whole duration, so readers
/// never observe a half-applied registration and `list` returns a consistent
/// snapshot.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: Mutex<HashMap<String, AddressRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, AddressRecord>> {
        // A panicking writer cannot leave a torn record behind: inserts are a
        // single HashMap::insert of a fully built value.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite the record for `id`.
    pub fn register(&self, id: &str, address: &str) {
        let record = AddressRecord {
            id: id.to_string(),
            address: address.to_string(),
        };

        let previous = self.records().insert(id.to_string(), record);

        match previous {
            Some(old) if old.address != address => {
                info!("Peer {} moved: {} -> {}", id, old.address, address)
            }
            Some(_) => debug!("Peer {} re-registered at {}", id, address),
            None => info!("Peer registered: {} → {}", id, address),
        }
    }

    /// Current address for `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<String> {
        self.records().get(id).map(|r| r.address.clone())
    }

    /// Point-in-time copy of every record. Order is unspecified.
    pub fn list(&self) -> Vec<AddressRecord> {
        self.records().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}
