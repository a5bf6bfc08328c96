//! Genesis description handling.
//!
//! The genesis JSON document is shared verbatim between all nodes of a
//! chain; it describes the chain parameters and the baker roster and
//! deterministically yields the genesis block.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tessera_types::{BakerInfo, GenesisData, Hash};
use tracing::{debug, info};

/// Genesis description: chain parameters plus the baker roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Genesis time, milliseconds since the Unix epoch
    pub time_ms: u64,
    /// Slot duration in milliseconds
    pub slot_duration_ms: u64,
    /// Per-slot election difficulty, in (0, 1)
    pub election_difficulty: f64,
    /// Slots per epoch
    pub epoch_length: u64,
    /// Minimum blocks skipped between finalized blocks
    pub min_skip: u64,
    /// Seed of the leadership election lottery
    pub leadership_election_nonce: Hash,
    /// The baker roster
    pub bakers: Vec<BakerInfo>,
}

impl GenesisConfig {
    /// Load a genesis description from a JSON file.
    pub fn load_json(path: &Path) -> ConfigResult<Self> {
        info!(path = %path.display(), "Loading genesis description");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let genesis: GenesisConfig = serde_json::from_str(&content)?;
        Ok(genesis)
    }

    /// Save the genesis description to a JSON file.
    pub fn save_json(&self, path: &Path) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Validate the description.
    pub fn validate(&self) -> ConfigResult<()> {
        debug!("Validating genesis description");

        if self.bakers.is_empty() {
            return Err(ConfigError::InvalidGenesis("no bakers".into()));
        }
        if !self.bakers.iter().any(|b| b.finalizer && b.stake > 0) {
            return Err(ConfigError::InvalidGenesis(
                "no staked finalization committee member".into(),
            ));
        }

        let mut seen = HashSet::new();
        for baker in &self.bakers {
            if !seen.insert(baker.id) {
                return Err(ConfigError::InvalidGenesis(format!(
                    "duplicate baker id {}",
                    baker.id
                )));
            }
        }

        if !(self.election_difficulty > 0.0 && self.election_difficulty < 1.0) {
            return Err(ConfigError::InvalidGenesis(format!(
                "election difficulty {} not in (0, 1)",
                self.election_difficulty
            )));
        }

        Ok(())
    }

    /// Produce the chain-parameter payload of the genesis block.
    pub fn into_genesis_data(self) -> ConfigResult<GenesisData> {
        self.validate()?;
        Ok(GenesisData {
            time_ms: self.time_ms,
            slot_duration_ms: self.slot_duration_ms,
            election_difficulty: self.election_difficulty,
            epoch_length: self.epoch_length,
            min_skip: self.min_skip,
            leadership_election_nonce: self.leadership_election_nonce,
            bakers: self.bakers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{BlsPublicKeyBytes, PublicKeyBytes, VrfPublicKeyBytes};

    fn test_baker(id: u64, finalizer: bool) -> BakerInfo {
        BakerInfo {
            id,
            sign_key: PublicKeyBytes([id as u8; 32]),
            vrf_key: VrfPublicKeyBytes([id as u8; 32]),
            bls_key: BlsPublicKeyBytes([id as u8; 96]),
            stake: 1000,
            finalizer,
        }
    }

    fn test_genesis() -> GenesisConfig {
        GenesisConfig {
            time_ms: 0,
            slot_duration_ms: 1000,
            election_difficulty: 0.5,
            epoch_length: 100,
            min_skip: 1,
            leadership_election_nonce: Hash::sha256(b"seed"),
            bakers: vec![test_baker(0, true), test_baker(1, true)],
        }
    }

    #[test]
    fn valid_genesis_converts() {
        let data = test_genesis().into_genesis_data().unwrap();
        assert_eq!(data.bakers.len(), 2);
    }

    #[test]
    fn duplicate_baker_rejected() {
        let mut genesis = test_genesis();
        genesis.bakers.push(test_baker(0, false));
        assert!(genesis.validate().is_err());
    }

    #[test]
    fn committee_required() {
        let mut genesis = test_genesis();
        for baker in &mut genesis.bakers {
            baker.finalizer = false;
        }
        assert!(genesis.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let genesis = test_genesis();
        let json = serde_json::to_string(&genesis).unwrap();
        let parsed: GenesisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.bakers, genesis.bakers);
    }
}
