//! Transaction manager configuration
//!
//! Loaded from JSON or built in code; every field has a default so a partial
//! document is enough.

use crate::{Result, TxnError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Id of this instance in the replica set. Rows written locally carry it
    /// and the limbo treats entries from it as its own.
    pub instance_id: u32,

    /// Number of acknowledgements (including our own write) a synchronous
    /// transaction needs before it is confirmed.
    pub synchro_quorum: usize,

    /// How long a synchronous commit waits for quorum.
    pub synchro_timeout_ms: u64,

    /// Commits slower than this are reported as "too long WAL write".
    pub too_long_threshold_ms: u64,

    /// When off, memtx transactions may not yield.
    pub memtx_use_mvcc_engine: bool,

    /// Per-transaction scratch memory budget (statements, trackers, edges).
    pub txn_region_limit: usize,

    /// Upper bound on live version-store entries; 0 = unlimited.
    pub max_stories: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            instance_id: 1,
            synchro_quorum: 1,
            synchro_timeout_ms: 5000,
            too_long_threshold_ms: 500,
            memtx_use_mvcc_engine: true,
            txn_region_limit: 16 * 1024 * 1024,
            max_stories: 0,
        }
    }
}

impl TxnConfig {
    /// Small limits and a short synchro timeout, for tests.
    pub fn for_testing() -> Self {
        Self {
            synchro_timeout_ms: 200,
            txn_region_limit: 1024 * 1024,
            ..Default::default()
        }
    }

    /// Sync replication preset: quorum of `quorum` instances.
    pub fn with_quorum(quorum: usize) -> Self {
        Self {
            synchro_quorum: quorum,
            ..Default::default()
        }
    }

    pub fn synchro_timeout(&self) -> Duration {
        Duration::from_millis(self.synchro_timeout_ms)
    }

    pub fn too_long_threshold(&self) -> Duration {
        Duration::from_millis(self.too_long_threshold_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id == 0 {
            return Err(TxnError::InvalidConfig(
                "instance_id 0 is reserved for rows without an origin".into(),
            ));
        }
        if self.synchro_quorum == 0 {
            return Err(TxnError::InvalidConfig("synchro_quorum must be at least 1".into()));
        }
        if self.txn_region_limit == 0 {
            return Err(TxnError::InvalidConfig("txn_region_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: TxnConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TxnError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
