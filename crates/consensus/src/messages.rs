//! Finalization wire messages.
//!
//! Every WMVBA step travels as a [`FinalizationMessage`]: a header naming
//! the session, finalization index, delta and sender, the WMVBA payload,
//! and the sender's Ed25519 signature over header and payload. Catch-up
//! exchanges bundle a [`FinalizationSummary`] into a signed
//! [`CatchUpMessage`].

use crate::committee::PartyIndex;
use tessera_types::serialize::{
    write_u32, write_u64, Deserial, ReadCursor, Serial, SerializationError, SerializeResult,
};
use tessera_types::{
    BlockHash, BlsSignatureBytes, FinalizationIndex, Hash, SignatureBytes, VrfProofBytes,
};
use tessera_crypto::{SignKeypair, SignPublicKey};
use std::fmt;

/// Block-height distance from the finalization target; doubles per failed
/// round.
pub type Delta = u64;

/// ABBA phase counter within one WMVBA round.
pub type Phase = u32;

/// One WMVBA protocol step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmvbaMessage {
    /// Freeze: propose a block hash as the round's value
    Proposal(BlockHash),
    /// Freeze: vote for a proposed value, or for "no value"
    Vote(Option<BlockHash>),
    /// ABBA: a party's input bit for a phase, with its coin ticket
    AbbaInput {
        /// The phase the bit belongs to
        phase: Phase,
        /// The bit
        bit: bool,
        /// VRF lottery ticket over `"TICKET" ‖ baid ‖ phase`
        ticket: VrfProofBytes,
    },
    /// CSS: the cumulative set of `(party, bit)` inputs the sender has seen
    CssSeen {
        /// The phase being reported on
        phase: Phase,
        /// Every input pair seen so far, ascending by party
        pairs: Vec<(PartyIndex, bool)>,
    },
    /// CSS: the sender has seen enough weight and stops reporting
    CssDoneReporting {
        /// The phase being closed out
        phase: Phase,
        /// The final set of pairs the sender saw
        pairs: Vec<(PartyIndex, bool)>,
    },
    /// ABBA: the sender considers the round decided with this bit
    WeAreDone(bool),
    /// Witness aggregation: a BLS signature on the decided value
    WitnessCreator {
        /// The decided block hash
        value: BlockHash,
        /// BLS signature over the witness message
        signature: BlsSignatureBytes,
    },
}

/// Which logical slot a message occupies for duplicate and equivocation
/// tracking: one slot per party per kind (and phase where phased).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Freeze proposal slot
    Proposal,
    /// Freeze vote slot
    Vote,
    /// ABBA input slot for a phase
    AbbaInput(Phase),
    /// CSS seen slot for a phase (cumulative, latest replaces)
    CssSeen(Phase),
    /// CSS done-reporting slot for a phase
    CssDoneReporting(Phase),
    /// Round-done slot
    WeAreDone,
    /// Witness signature slot
    WitnessCreator,
}

impl WmvbaMessage {
    /// The message's dedup/equivocation slot.
    pub fn kind(&self) -> MessageKind {
        match self {
            WmvbaMessage::Proposal(_) => MessageKind::Proposal,
            WmvbaMessage::Vote(_) => MessageKind::Vote,
            WmvbaMessage::AbbaInput { phase, .. } => MessageKind::AbbaInput(*phase),
            WmvbaMessage::CssSeen { phase, .. } => MessageKind::CssSeen(*phase),
            WmvbaMessage::CssDoneReporting { phase, .. } => {
                MessageKind::CssDoneReporting(*phase)
            }
            WmvbaMessage::WeAreDone(_) => MessageKind::WeAreDone,
            WmvbaMessage::WitnessCreator { .. } => MessageKind::WitnessCreator,
        }
    }

    /// The phase a message belongs to, if it is phase-scoped.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            WmvbaMessage::AbbaInput { phase, .. }
            | WmvbaMessage::CssSeen { phase, .. }
            | WmvbaMessage::CssDoneReporting { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

fn serial_pairs(pairs: &[(PartyIndex, bool)], out: &mut Vec<u8>) {
    write_u32(out, pairs.len() as u32);
    for (party, bit) in pairs {
        write_u32(out, *party);
        out.push(u8::from(*bit));
    }
}

fn deserial_pairs(src: &mut ReadCursor<'_>) -> SerializeResult<Vec<(PartyIndex, bool)>> {
    let count = src.read_u32()?;
    if u64::from(count) > tessera_types::serialize::ALLOCATION_LIMIT {
        return Err(SerializationError::OversizedLength(
            "css pair list",
            u64::from(count),
        ));
    }
    let mut pairs = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let party = src.read_u32()?;
        let bit = read_bool(src, "css pair bit")?;
        pairs.push((party, bit));
    }
    Ok(pairs)
}

fn read_bool(src: &mut ReadCursor<'_>, field: &'static str) -> SerializeResult<bool> {
    match src.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(SerializationError::InvalidField {
            field,
            reason: format!("expected 0 or 1, got {other}"),
        }),
    }
}

impl Serial for WmvbaMessage {
    fn serial(&self, out: &mut Vec<u8>) {
        match self {
            WmvbaMessage::Proposal(value) => {
                out.push(0);
                value.serial(out);
            }
            WmvbaMessage::Vote(value) => {
                out.push(1);
                match value {
                    None => out.push(0),
                    Some(value) => {
                        out.push(1);
                        value.serial(out);
                    }
                }
            }
            WmvbaMessage::AbbaInput { phase, bit, ticket } => {
                out.push(2);
                write_u32(out, *phase);
                out.push(u8::from(*bit));
                ticket.serial(out);
            }
            WmvbaMessage::CssSeen { phase, pairs } => {
                out.push(3);
                write_u32(out, *phase);
                serial_pairs(pairs, out);
            }
            WmvbaMessage::CssDoneReporting { phase, pairs } => {
                out.push(4);
                write_u32(out, *phase);
                serial_pairs(pairs, out);
            }
            WmvbaMessage::WeAreDone(bit) => {
                out.push(5);
                out.push(u8::from(*bit));
            }
            WmvbaMessage::WitnessCreator { value, signature } => {
                out.push(6);
                value.serial(out);
                signature.serial(out);
            }
        }
    }
}

impl Deserial for WmvbaMessage {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        match src.read_u8()? {
            0 => Ok(WmvbaMessage::Proposal(BlockHash::deserial(src)?)),
            1 => {
                let value = if read_bool(src, "vote tag")? {
                    Some(BlockHash::deserial(src)?)
                } else {
                    None
                };
                Ok(WmvbaMessage::Vote(value))
            }
            2 => Ok(WmvbaMessage::AbbaInput {
                phase: src.read_u32()?,
                bit: read_bool(src, "abba bit")?,
                ticket: VrfProofBytes::deserial(src)?,
            }),
            3 => Ok(WmvbaMessage::CssSeen {
                phase: src.read_u32()?,
                pairs: deserial_pairs(src)?,
            }),
            4 => Ok(WmvbaMessage::CssDoneReporting {
                phase: src.read_u32()?,
                pairs: deserial_pairs(src)?,
            }),
            5 => Ok(WmvbaMessage::WeAreDone(read_bool(src, "done bit")?)),
            6 => Ok(WmvbaMessage::WitnessCreator {
                value: BlockHash::deserial(src)?,
                signature: BlsSignatureBytes::deserial(src)?,
            }),
            tag => Err(SerializationError::InvalidField {
                field: "wmvba message tag",
                reason: format!("unknown tag {tag}"),
            }),
        }
    }
}

/// The envelope header of a finalization message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationMessageHeader {
    /// Session id: the genesis block hash
    pub session: Hash,
    /// The finalization index the message belongs to
    pub index: FinalizationIndex,
    /// The delta of the round within that index
    pub delta: Delta,
    /// Committee index of the sender
    pub sender: PartyIndex,
}

impl Serial for FinalizationMessageHeader {
    fn serial(&self, out: &mut Vec<u8>) {
        self.session.serial(out);
        write_u64(out, self.index);
        write_u64(out, self.delta);
        write_u32(out, self.sender);
    }
}

impl Deserial for FinalizationMessageHeader {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        Ok(Self {
            session: Hash::deserial(src)?,
            index: src.read_u64()?,
            delta: src.read_u64()?,
            sender: src.read_u32()?,
        })
    }
}

/// A signed WMVBA step on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationMessage {
    /// Envelope header
    pub header: FinalizationMessageHeader,
    /// The WMVBA payload
    pub message: WmvbaMessage,
    /// Sender's signature over header and payload
    pub signature: SignatureBytes,
}

impl FinalizationMessage {
    /// The bytes covered by the envelope signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.serial(&mut out);
        self.message.serial(&mut out);
        out
    }

    /// Builds and signs a message.
    pub fn sign(
        header: FinalizationMessageHeader,
        message: WmvbaMessage,
        keypair: &SignKeypair,
    ) -> Self {
        let mut unsigned = Self {
            header,
            message,
            signature: SignatureBytes::default(),
        };
        unsigned.signature = keypair.sign(&unsigned.signable_bytes());
        unsigned
    }

    /// Verifies the envelope signature against a sender key.
    pub fn verify(&self, key: &SignPublicKey) -> bool {
        key.verify(&self.signable_bytes(), &self.signature)
    }

    /// A stable identity for de-duplication in pending stores.
    pub fn dedup_hash(&self) -> Hash {
        Hash::sha256(&self.to_bytes())
    }
}

impl Serial for FinalizationMessage {
    fn serial(&self, out: &mut Vec<u8>) {
        self.header.serial(out);
        self.message.serial(out);
        self.signature.serial(out);
    }
}

impl Deserial for FinalizationMessage {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        Ok(Self {
            header: FinalizationMessageHeader::deserial(src)?,
            message: WmvbaMessage::deserial(src)?,
            signature: SignatureBytes::deserial(src)?,
        })
    }
}

impl fmt::Display for FinalizationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finalization message (index: {}, delta: {}, sender: {}, kind: {:?})",
            self.header.index,
            self.header.delta,
            self.header.sender,
            self.message.kind()
        )
    }
}

/// Evidence that one round failed: per-party signatures on
/// `WeAreDone(false)` at that round's delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRoundEvidence {
    /// The delta of the failed round
    pub delta: Delta,
    /// Party → envelope signature on its `WeAreDone(false)`
    pub signatures: Vec<(PartyIndex, SignatureBytes)>,
}

impl Serial for FailedRoundEvidence {
    fn serial(&self, out: &mut Vec<u8>) {
        write_u64(out, self.delta);
        write_u32(out, self.signatures.len() as u32);
        for (party, signature) in &self.signatures {
            write_u32(out, *party);
            signature.serial(out);
        }
    }
}

impl Deserial for FailedRoundEvidence {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let delta = src.read_u64()?;
        let count = src.read_u32()?;
        if u64::from(count) > tessera_types::serialize::ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(
                "failed round signatures",
                u64::from(count),
            ));
        }
        let mut signatures = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let party = src.read_u32()?;
            let signature = SignatureBytes::deserial(src)?;
            signatures.push((party, signature));
        }
        Ok(Self { delta, signatures })
    }
}

/// A node's view of one finalization index: evidence for every failed
/// round (newest first) plus the messages of the current round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinalizationSummary {
    /// Failed rounds, newest first
    pub failed_rounds: Vec<FailedRoundEvidence>,
    /// Signed messages of the current round
    pub messages: Vec<FinalizationMessage>,
}

impl Serial for FinalizationSummary {
    fn serial(&self, out: &mut Vec<u8>) {
        write_u32(out, self.failed_rounds.len() as u32);
        for round in &self.failed_rounds {
            round.serial(out);
        }
        write_u32(out, self.messages.len() as u32);
        for message in &self.messages {
            message.serial(out);
        }
    }
}

impl Deserial for FinalizationSummary {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let round_count = src.read_u32()?;
        if u64::from(round_count) > tessera_types::serialize::ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(
                "failed rounds",
                u64::from(round_count),
            ));
        }
        let mut failed_rounds = Vec::with_capacity(round_count.min(4096) as usize);
        for _ in 0..round_count {
            failed_rounds.push(FailedRoundEvidence::deserial(src)?);
        }
        let message_count = src.read_u32()?;
        if u64::from(message_count) > tessera_types::serialize::ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(
                "summary messages",
                u64::from(message_count),
            ));
        }
        let mut messages = Vec::with_capacity(message_count.min(4096) as usize);
        for _ in 0..message_count {
            messages.push(FinalizationMessage::deserial(src)?);
        }
        Ok(Self {
            failed_rounds,
            messages,
        })
    }
}

/// A signed catch-up status: the sender's summary of its current
/// finalization index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpMessage {
    /// Session id: the genesis block hash
    pub session: Hash,
    /// The sender's current finalization index
    pub index: FinalizationIndex,
    /// Committee index of the sender
    pub sender: PartyIndex,
    /// The sender's round summary
    pub summary: FinalizationSummary,
    /// Sender's signature over all of the above
    pub signature: SignatureBytes,
}

impl CatchUpMessage {
    /// The bytes covered by the signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.session.serial(&mut out);
        write_u64(&mut out, self.index);
        write_u32(&mut out, self.sender);
        self.summary.serial(&mut out);
        out
    }

    /// Builds and signs a catch-up message.
    pub fn sign(
        session: Hash,
        index: FinalizationIndex,
        sender: PartyIndex,
        summary: FinalizationSummary,
        keypair: &SignKeypair,
    ) -> Self {
        let mut unsigned = Self {
            session,
            index,
            sender,
            summary,
            signature: SignatureBytes::default(),
        };
        unsigned.signature = keypair.sign(&unsigned.signable_bytes());
        unsigned
    }

    /// Verifies the signature against a sender key.
    pub fn verify(&self, key: &SignPublicKey) -> bool {
        key.verify(&self.signable_bytes(), &self.signature)
    }
}

impl Serial for CatchUpMessage {
    fn serial(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signable_bytes());
        self.signature.serial(out);
    }
}

impl Deserial for CatchUpMessage {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let session = Hash::deserial(src)?;
        let index = src.read_u64()?;
        let sender = src.read_u32()?;
        let summary = FinalizationSummary::deserial(src)?;
        let signature = SignatureBytes::deserial(src)?;
        Ok(Self {
            session,
            index,
            sender,
            summary,
            signature,
        })
    }
}

/// The message BLS witness signatures cover for a round and value.
pub fn witness_message(baid: &[u8], value: &BlockHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + baid.len() + 32);
    out.extend_from_slice(b"WITNESS");
    out.extend_from_slice(baid);
    out.extend_from_slice(value.as_bytes());
    out
}

/// The VRF input for a party's ABBA coin ticket.
pub fn ticket_input(baid: &[u8], phase: Phase) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + baid.len() + 4);
    out.extend_from_slice(b"TICKET");
    out.extend_from_slice(baid);
    out.extend_from_slice(&phase.to_be_bytes());
    out
}

/// The byzantine-agreement instance id for `(session, index, delta)`.
pub fn make_baid(session: &Hash, index: FinalizationIndex, delta: Delta) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 16);
    out.extend_from_slice(session.as_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&delta.to_be_bytes());
    out
}
