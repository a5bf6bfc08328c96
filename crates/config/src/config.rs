//! Main configuration module for the Tessera node.
//!
//! All node-local settings are defined in one `tessera.toml` file. Chain
//! parameters (slot duration, election difficulty, the roster) are *not*
//! configuration: they come from the genesis block.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Node-local configuration, loaded from `tessera.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Data directory and persistence settings
    #[serde(default)]
    pub node: NodeSettings,

    /// Baking settings
    #[serde(default)]
    pub baker: BakerSettings,

    /// Transaction table settings
    #[serde(default)]
    pub transactions: TransactionSettings,

    /// Finalization timing settings
    #[serde(default)]
    pub finalization: FinalizationSettings,
}

/// Data directory and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Directory holding the blob file and other node state
    pub data_dir: PathBuf,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/tessera"),
        }
    }
}

/// Baking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BakerSettings {
    /// This node's baker identity; `None` for a non-baking node
    pub baker_id: Option<u64>,
    /// Maximum serialized size of a baked block's transaction list, bytes
    pub max_block_size: u64,
    /// Maximum total energy of a baked block's transactions
    pub max_block_energy: u64,
    /// How many slots ahead of the clock a received block may claim before
    /// it is rejected as early
    pub early_block_threshold: u64,
}

impl Default for BakerSettings {
    fn default() -> Self {
        Self {
            baker_id: None,
            max_block_size: 1_048_576,
            max_block_energy: 3_000_000,
            early_block_threshold: 30,
        }
    }
}

/// Transaction table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// Slots a received-but-uncommitted transaction is kept before purge
    pub keep_alive_slots: u64,
    /// Seconds between runs of the purge thread
    pub purging_delay_secs: u64,
    /// Insertions between purge sweeps (amortizes purge cost)
    pub insertions_before_purge: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            keep_alive_slots: 600,
            purging_delay_secs: 300,
            insertions_before_purge: 1000,
        }
    }
}

/// Finalization timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationSettings {
    /// Base delay before a round's catch-up replay, milliseconds
    pub replay_base_delay_ms: u64,
    /// Additional replay delay per committee member per attempt, ms
    pub replay_per_party_ms: u64,
    /// Upper bound on how long a Seen message may sit in the output buffer
    pub seen_max_delay_ms: u64,
    /// Step by which buffered Seen messages are delayed
    pub seen_delay_step_ms: u64,
    /// Window for de-duplicating received catch-up signatures, seconds
    pub catch_up_dedup_window_secs: u64,
}

impl Default for FinalizationSettings {
    fn default() -> Self {
        Self {
            replay_base_delay_ms: 300,
            replay_per_party_ms: 50,
            seen_max_delay_ms: 10_000,
            seen_delay_step_ms: 1_000,
            catch_up_dedup_window_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        debug!("Configuration loaded and validated");
        Ok(config)
    }

    /// Validate setting ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.baker.max_block_size == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "baker.max_block_size",
                reason: "must be positive".into(),
            });
        }
        if self.baker.max_block_energy == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "baker.max_block_energy",
                reason: "must be positive".into(),
            });
        }
        if self.transactions.purging_delay_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "transactions.purging_delay_secs",
                reason: "must be positive".into(),
            });
        }
        if self.finalization.seen_delay_step_ms == 0
            || self.finalization.seen_delay_step_ms > self.finalization.seen_max_delay_ms
        {
            return Err(ConfigError::InvalidSetting {
                setting: "finalization.seen_delay_step_ms",
                reason: "must be positive and at most seen_max_delay_ms".into(),
            });
        }
        Ok(())
    }
}
