//! The finalization committee.
//!
//! A committee is fixed per finalization index: an ordered vector of
//! parties, each with signing, VRF and BLS keys and a stake-derived voter
//! weight. All WMVBA thresholds are weighted sums over this committee.

use tessera_crypto::{BlsPublicKey, BlsSecretKey, SignKeypair, SignPublicKey, VrfPublicKey, VrfSecretKey};
use tessera_types::{BakerId, GenesisData};
use tracing::debug;

/// Index of a party within its committee.
pub type PartyIndex = u32;

/// One committee member.
#[derive(Clone, Debug)]
pub struct Party {
    /// Position in the committee's ordered vector
    pub index: PartyIndex,
    /// The member's baker identity
    pub baker_id: BakerId,
    /// Key finalization messages are verified against
    pub sign_key: SignPublicKey,
    /// Key ABBA coin tickets are verified against
    pub vrf_key: VrfPublicKey,
    /// Key witness signatures are verified against
    pub bls_key: BlsPublicKey,
    /// Voter power
    pub weight: u64,
}

/// Errors building a committee from a roster.
#[derive(Debug, thiserror::Error)]
pub enum CommitteeError {
    /// A roster entry carries an undecodable key
    #[error("baker {baker_id} has an invalid {key_kind} key")]
    InvalidKey {
        /// The offending roster entry
        baker_id: BakerId,
        /// Which of its keys failed to decode
        key_kind: &'static str,
    },

    /// No staked finalizer in the roster
    #[error("the roster contains no staked finalization committee member")]
    EmptyCommittee,
}

/// The ordered finalization committee with its derived weights.
#[derive(Clone, Debug)]
pub struct FinalizationCommittee {
    parties: Vec<Party>,
    total_weight: u64,
    corrupt_weight: u64,
}

impl FinalizationCommittee {
    /// Builds the committee from the genesis roster: every staked baker
    /// flagged as a finalizer, in roster order.
    pub fn from_genesis(genesis: &GenesisData) -> Result<Self, CommitteeError> {
        let mut parties = Vec::new();
        for baker in genesis.bakers.iter().filter(|b| b.finalizer && b.stake > 0) {
            let sign_key = SignPublicKey::from_bytes(&baker.sign_key).map_err(|_| {
                CommitteeError::InvalidKey {
                    baker_id: baker.id,
                    key_kind: "signing",
                }
            })?;
            let vrf_key = VrfPublicKey::from_bytes(&baker.vrf_key).map_err(|_| {
                CommitteeError::InvalidKey {
                    baker_id: baker.id,
                    key_kind: "VRF",
                }
            })?;
            let bls_key = BlsPublicKey::from_bytes(&baker.bls_key).map_err(|_| {
                CommitteeError::InvalidKey {
                    baker_id: baker.id,
                    key_kind: "BLS",
                }
            })?;
            parties.push(Party {
                index: parties.len() as PartyIndex,
                baker_id: baker.id,
                sign_key,
                vrf_key,
                bls_key,
                weight: baker.stake,
            });
        }
        if parties.is_empty() {
            return Err(CommitteeError::EmptyCommittee);
        }
        let total_weight: u64 = parties.iter().map(|p| p.weight).sum();
        let corrupt_weight = (total_weight - 1) / 3;
        debug!(
            parties = parties.len(),
            total_weight, corrupt_weight, "Built finalization committee"
        );
        Ok(Self {
            parties,
            total_weight,
            corrupt_weight,
        })
    }

    /// The party at `index`, if any.
    pub fn party(&self, index: PartyIndex) -> Option<&Party> {
        self.parties.get(index as usize)
    }

    /// The committee index of a baker, if it is a member.
    pub fn party_of_baker(&self, baker_id: BakerId) -> Option<PartyIndex> {
        self.parties
            .iter()
            .find(|p| p.baker_id == baker_id)
            .map(|p| p.index)
    }

    /// The voter power of a party (0 for unknown indices).
    pub fn weight(&self, index: PartyIndex) -> u64 {
        self.party(index).map_or(0, |p| p.weight)
    }

    /// Number of parties.
    pub fn len(&self) -> usize {
        self.parties.len()
    }

    /// Whether the committee is empty (it never is once constructed).
    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    /// Iterate the parties in committee order.
    pub fn parties(&self) -> impl Iterator<Item = &Party> {
        self.parties.iter()
    }

    /// Sum of all voter power.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// The corruption bound `⌊(total − 1) / 3⌋`.
    pub fn corrupt_weight(&self) -> u64 {
        self.corrupt_weight
    }

    /// The progress threshold `total − corrupt`: weight required for any
    /// WMVBA step to advance.
    pub fn progress_weight(&self) -> u64 {
        self.total_weight - self.corrupt_weight
    }
}

/// Our own credentials as a committee member.
#[derive(Clone)]
pub struct FinalizationKeys {
    /// Signing keypair for finalization message envelopes
    pub sign: SignKeypair,
    /// VRF key for ABBA coin tickets
    pub vrf: VrfSecretKey,
    /// BLS key for witness signatures
    pub bls: BlsSecretKey,
}
