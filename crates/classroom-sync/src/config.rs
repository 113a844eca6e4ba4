//! Runtime configuration for the sync layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_UPDATE_CAPACITY;

/// Default local store namespace.
pub const DEFAULT_NAMESPACE: &str = "classroom";

/// Configuration for [`ClassroomSync`](crate::ClassroomSync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix of every local store key.
    pub namespace: String,
    /// Directory of the file-backed local store. `None` lets the caller pick
    /// a platform default.
    pub store_dir: Option<PathBuf>,
    /// Push surviving local-only records to the remote during a full reload.
    pub promote_local_on_reload: bool,
    /// Capacity of the pending mutation diagnostics ring.
    pub max_pending_mutations: usize,
    /// Capacity of the cache update and class reset broadcast channels.
    pub update_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            store_dir: None,
            promote_local_on_reload: true,
            max_pending_mutations: 256,
            update_channel_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"namespace": "school", "max_pending_mutations": 8}"#)
            .unwrap();
        assert_eq!(config.namespace, "school");
        assert_eq!(config.max_pending_mutations, 8);
        assert!(config.promote_local_on_reload);
        assert_eq!(config.update_channel_capacity, 1024);
    }
}
