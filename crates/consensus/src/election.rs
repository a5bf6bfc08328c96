//! Leader election: the per-slot VRF lottery.
//!
//! Each slot, every baker evaluates its VRF over the leadership input for
//! that slot. The baker wins when the output, read as a uniform fraction,
//! falls below `1 − (1 − difficulty)^power`, where `power` is the baker's
//! share of the snapshot's total stake. The snapshot (the *Birk
//! parameters*) is inherited from the parent block and its seed is
//! re-derived at epoch boundaries, so the lottery for an epoch is fixed
//! before the epoch begins.

use tessera_crypto::{SignPublicKey, VrfOutput, VrfProof, VrfPublicKey, VrfSecretKey};
use tessera_types::{BakerId, GenesisData, Hash, Slot, VrfProofBytes};

/// One baker in a lottery snapshot.
#[derive(Clone, Debug)]
pub struct LotteryBaker {
    /// The baker's identity
    pub baker_id: BakerId,
    /// Key its block signatures are verified against
    pub sign_key: SignPublicKey,
    /// Key its election proofs are verified against
    pub vrf_key: VrfPublicKey,
    /// The baker's share of total stake, in (0, 1]
    pub lottery_power: f64,
}

/// Errors from the election layer.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// A roster entry carries an undecodable key
    #[error("baker {0} has an invalid key in the lottery snapshot")]
    InvalidKey(BakerId),

    /// The roster has no staked baker
    #[error("the lottery snapshot has no staked baker")]
    NoBakers,
}

/// The per-epoch lottery snapshot.
#[derive(Clone, Debug)]
pub struct BirkParameters {
    /// Per-slot election difficulty
    pub election_difficulty: f64,
    /// Seed of the leadership lottery for this epoch
    pub leadership_election_nonce: Hash,
    /// The epoch this snapshot is valid for
    pub epoch: u64,
    /// The staked bakers and their powers
    pub bakers: Vec<LotteryBaker>,
}

impl BirkParameters {
    /// Builds the epoch-0 snapshot from genesis.
    pub fn from_genesis(genesis: &GenesisData) -> Result<Self, ElectionError> {
        let total_stake: u64 = genesis.bakers.iter().map(|b| b.stake).sum();
        if total_stake == 0 {
            return Err(ElectionError::NoBakers);
        }
        let mut bakers = Vec::with_capacity(genesis.bakers.len());
        for baker in genesis.bakers.iter().filter(|b| b.stake > 0) {
            let sign_key = SignPublicKey::from_bytes(&baker.sign_key)
                .map_err(|_| ElectionError::InvalidKey(baker.id))?;
            let vrf_key = VrfPublicKey::from_bytes(&baker.vrf_key)
                .map_err(|_| ElectionError::InvalidKey(baker.id))?;
            bakers.push(LotteryBaker {
                baker_id: baker.id,
                sign_key,
                vrf_key,
                lottery_power: baker.stake as f64 / total_stake as f64,
            });
        }
        Ok(Self {
            election_difficulty: genesis.election_difficulty,
            leadership_election_nonce: genesis.leadership_election_nonce,
            epoch: 0,
            bakers,
        })
    }

    /// Derives the snapshot for a later epoch: same roster, re-seeded
    /// nonce. The roster is fixed at genesis (staking changes are handled
    /// by the execution layer, outside this core).
    pub fn for_epoch(&self, epoch: u64) -> Self {
        if epoch == self.epoch {
            return self.clone();
        }
        let mut snapshot = self.clone();
        let mut nonce = self.leadership_election_nonce;
        for next_epoch in (self.epoch + 1)..=epoch {
            nonce = Hash::sha256_concat(&[
                b"TESSERA_EPOCH_NONCE",
                nonce.as_bytes(),
                &next_epoch.to_be_bytes(),
            ]);
        }
        snapshot.leadership_election_nonce = nonce;
        snapshot.epoch = epoch;
        snapshot
    }

    /// Looks up a baker in the snapshot.
    pub fn baker(&self, baker_id: BakerId) -> Option<&LotteryBaker> {
        self.bakers.iter().find(|b| b.baker_id == baker_id)
    }
}

/// The VRF input for the slot-leadership lottery.
pub fn leadership_input(nonce: &Hash, slot: Slot) -> Vec<u8> {
    let mut input = Vec::with_capacity(2 + 32 + 8);
    input.extend_from_slice(b"LE");
    input.extend_from_slice(nonce.as_bytes());
    input.extend_from_slice(&slot.to_be_bytes());
    input
}

/// The VRF input for the block nonce.
pub fn block_nonce_input(nonce: &Hash, slot: Slot) -> Vec<u8> {
    let mut input = Vec::with_capacity(5 + 32 + 8);
    input.extend_from_slice(b"NONCE");
    input.extend_from_slice(nonce.as_bytes());
    input.extend_from_slice(&slot.to_be_bytes());
    input
}

/// Whether a VRF output wins the lottery at the given power and difficulty.
pub fn election_success(output: &VrfOutput, lottery_power: f64, difficulty: f64) -> bool {
    output.to_fraction() < 1.0 - (1.0 - difficulty).powf(lottery_power)
}

/// Evaluates our own lottery for a slot, returning the proof on a win.
pub fn try_win_slot(
    vrf: &VrfSecretKey,
    params: &BirkParameters,
    baker_id: BakerId,
    slot: Slot,
) -> Option<VrfProof> {
    let baker = params.baker(baker_id)?;
    let input = leadership_input(&params.leadership_election_nonce, slot);
    let (output, proof) = vrf.prove(&input);
    if election_success(&output, baker.lottery_power, params.election_difficulty) {
        Some(proof)
    } else {
        None
    }
}

/// Verifies another baker's election proof for a slot.
pub fn verify_election(
    params: &BirkParameters,
    baker_id: BakerId,
    slot: Slot,
    proof: &VrfProofBytes,
) -> bool {
    let Some(baker) = params.baker(baker_id) else {
        return false;
    };
    let input = leadership_input(&params.leadership_election_nonce, slot);
    let proof = VrfProof::from_bytes(proof);
    match baker.vrf_key.verify(&input, &proof) {
        Some(output) => {
            election_success(&output, baker.lottery_power, params.election_difficulty)
        }
        None => false,
    }
}

/// Verifies a block's VRF nonce proof for a slot.
pub fn verify_block_nonce(
    params: &BirkParameters,
    baker_id: BakerId,
    slot: Slot,
    proof: &VrfProofBytes,
) -> bool {
    let Some(baker) = params.baker(baker_id) else {
        return false;
    };
    let input = block_nonce_input(&params.leadership_election_nonce, slot);
    baker
        .vrf_key
        .verify(&input, &VrfProof::from_bytes(proof))
        .is_some()
}
