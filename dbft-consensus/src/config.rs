use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConsensusConfig {
    /// Target interval between blocks in milliseconds.
    pub milliseconds_per_block: u64,
    pub max_transactions_per_block: usize,
    /// Maximum encoded block size in bytes.
    pub max_block_size: usize,
    pub max_block_system_fee: u64,
    pub block_version: u32,
    /// Do not restore the round snapshot at start-up.
    pub ignore_recovery_logs: bool,
}

impl ConsensusConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.milliseconds_per_block)
    }

    pub fn with_block_time(mut self, d: Duration) -> Self {
        self.milliseconds_per_block = d.as_millis() as u64;
        self
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            milliseconds_per_block: 15_000,
            max_transactions_per_block: 512,
            max_block_size: 262_144,
            max_block_system_fee: 150_000_000_000,
            block_version: 0,
            ignore_recovery_logs: false,
        }
    }
}
