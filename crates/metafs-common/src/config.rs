//! Configuration types for MetaFS
//!
//! This module defines the configuration consumed by the metadata-server
//! core. Network and daemon settings live with the daemon, not here.

use crate::types::RankId;
use serde::{Deserialize, Serialize};

/// Configuration for one metadata-server rank
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsConfig {
    /// Rank identity of this metadata server
    pub rank: RankId,
    /// Pool holding MDS metadata objects
    pub metadata_pool: i64,
    /// Batch size for a single session-map OMAP read, and the soft cap on
    /// the staged dirty set that triggers a preemptive save
    pub sessionmap_keys_per_op: usize,
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            rank: RankId(0),
            metadata_pool: 1,
            sessionmap_keys_per_op: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MdsConfig::default();
        assert_eq!(config.rank, RankId(0));
        assert_eq!(config.sessionmap_keys_per_op, 1024);
    }
}
