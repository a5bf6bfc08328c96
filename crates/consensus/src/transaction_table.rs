//! The transaction table.
//!
//! Tracks every transaction the node knows about, keyed by hash, together
//! with a per-sender nonce-ordered pending set. A transaction moves
//! `Received → Committed → Finalized`; commitment is per-block (one
//! transaction can be committed to several competing branches), and
//! finalizing a block settles the `(sender, nonce)` slot for good.
//!
//! Invariants:
//! - for each sender, `next_nonce` is the smallest nonce not yet finalized
//! - every transaction committed to a live block is present in the table
//! - finalizing a transaction removes every competitor at its
//!   `(sender, nonce)`

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tessera_types::{AccountAddress, BlockHash, Nonce, Slot, Transaction, TransactionHash};
use tracing::{debug, trace};

/// Lifecycle status of a known transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Known but not yet committed to any live block
    Received {
        /// Slot the transaction was last received in
        slot: Slot,
    },
    /// Committed to one or more live blocks
    Committed {
        /// Slot the transaction was last received in
        slot: Slot,
        /// Block hash → index of this transaction within that block
        blocks: HashMap<BlockHash, u64>,
    },
    /// Settled by a finalized block
    Finalized {
        /// Slot the transaction was last received in
        slot: Slot,
        /// The finalized block containing it
        block: BlockHash,
        /// Its index within that block
        index: u64,
    },
}

impl TransactionStatus {
    fn slot(&self) -> Slot {
        match self {
            TransactionStatus::Received { slot }
            | TransactionStatus::Committed { slot, .. }
            | TransactionStatus::Finalized { slot, .. } => *slot,
        }
    }
}

/// Outcome of inserting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The transaction is new and was stored
    Added,
    /// The transaction was already known; its receive slot was bumped
    Duplicate,
    /// The transaction's nonce is below the sender's next nonce
    ObsoleteNonce,
}

#[derive(Debug, Default)]
struct AccountEntry {
    /// Nonce → competing transactions at that nonce
    nonces: BTreeMap<Nonce, BTreeSet<TransactionHash>>,
    /// Smallest nonce not yet finalized; accounts start at 1
    next_nonce: Nonce,
}

impl AccountEntry {
    fn new() -> Self {
        Self {
            nonces: BTreeMap::new(),
            next_nonce: 1,
        }
    }
}

/// The transaction table.
#[derive(Debug, Default)]
pub struct TransactionTable {
    transactions: HashMap<TransactionHash, (Transaction, TransactionStatus)>,
    accounts: HashMap<AccountAddress, AccountEntry>,
    /// Insertions since the last purge sweep; gates amortized purging
    insertions: u64,
}

impl TransactionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a transaction and its status.
    pub fn get(&self, hash: &TransactionHash) -> Option<&(Transaction, TransactionStatus)> {
        self.transactions.get(hash)
    }

    /// The smallest nonce not yet finalized for `sender`.
    pub fn next_nonce(&self, sender: &AccountAddress) -> Nonce {
        self.accounts.get(sender).map_or(1, |a| a.next_nonce)
    }

    /// Number of known transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Inserts a transaction received at `slot`, or bumps the receive slot
    /// of a known one.
    pub fn add_transaction(&mut self, tx: Transaction, slot: Slot) -> AddResult {
        let hash = tx.hash();
        if let Some((_, status)) = self.transactions.get_mut(&hash) {
            // Finalized entries are immutable; everything else gets its
            // receive slot bumped so purging counts from the latest sighting.
            match status {
                TransactionStatus::Finalized { .. } => return AddResult::Duplicate,
                TransactionStatus::Received { slot: s }
                | TransactionStatus::Committed { slot: s, .. } => {
                    *s = (*s).max(slot);
                    return AddResult::Duplicate;
                }
            }
        }

        let account = self
            .accounts
            .entry(tx.sender)
            .or_insert_with(AccountEntry::new);
        if tx.nonce < account.next_nonce {
            trace!(tx = %hash.short(), nonce = tx.nonce, next = account.next_nonce, "Obsolete nonce");
            return AddResult::ObsoleteNonce;
        }

        account.nonces.entry(tx.nonce).or_default().insert(hash);
        self.transactions
            .insert(hash, (tx, TransactionStatus::Received { slot }));
        self.insertions += 1;
        AddResult::Added
    }

    /// Marks a transaction as committed to `block` at position `index`.
    ///
    /// Returns false if the transaction is unknown.
    pub fn commit_transaction(
        &mut self,
        block: BlockHash,
        slot: Slot,
        hash: TransactionHash,
        index: u64,
    ) -> bool {
        let Some((_, status)) = self.transactions.get_mut(&hash) else {
            return false;
        };
        match status {
            TransactionStatus::Received { slot: s } => {
                let mut blocks = HashMap::new();
                blocks.insert(block, index);
                *status = TransactionStatus::Committed {
                    slot: (*s).max(slot),
                    blocks,
                };
            }
            TransactionStatus::Committed { slot: s, blocks } => {
                blocks.insert(block, index);
                *s = (*s).max(slot);
            }
            TransactionStatus::Finalized { .. } => {}
        }
        true
    }

    /// Settles the transactions of a finalized block: each becomes
    /// `Finalized`, all competitors at the same `(sender, nonce)` are
    /// removed, and the sender's next nonce advances.
    pub fn finalize_transactions(&mut self, block: BlockHash, slot: Slot, txs: &[Transaction]) {
        for tx in txs {
            let hash = tx.hash();
            let index = match self.transactions.get(&hash) {
                Some((_, TransactionStatus::Committed { blocks, .. })) => {
                    blocks.get(&block).copied().unwrap_or_default()
                }
                _ => 0,
            };
            if let Some((_, status)) = self.transactions.get_mut(&hash) {
                *status = TransactionStatus::Finalized {
                    slot,
                    block,
                    index,
                };
            }

            if let Some(account) = self.accounts.get_mut(&tx.sender) {
                if let Some(competitors) = account.nonces.remove(&tx.nonce) {
                    for competitor in competitors {
                        if competitor != hash {
                            trace!(tx = %competitor.short(), "Dropping competing transaction");
                            self.transactions.remove(&competitor);
                        }
                    }
                }
                account.next_nonce = account.next_nonce.max(tx.nonce + 1);
            }
        }
        debug!(block = %block.short(), count = txs.len(), "Finalized transactions");
    }

    /// Reverts the commit of `block` for each of its transactions: entries
    /// committed only to `block` fall back to `Received`, or are purged
    /// outright when their slot is at or below the finalized horizon.
    pub fn revert_block(
        &mut self,
        block: &BlockHash,
        txs: &[Transaction],
        last_finalized_slot: Slot,
    ) {
        for tx in txs {
            let hash = tx.hash();
            let purge = match self.transactions.get_mut(&hash) {
                Some((_, status)) => match status {
                    TransactionStatus::Committed { slot, blocks } => {
                        blocks.remove(block);
                        if blocks.is_empty() {
                            if *slot <= last_finalized_slot {
                                true
                            } else {
                                *status = TransactionStatus::Received { slot: *slot };
                                false
                            }
                        } else {
                            false
                        }
                    }
                    _ => false,
                },
                None => false,
            };
            if purge {
                self.remove_entry(&hash);
            }
        }
    }

    /// Whether enough insertions have accumulated to warrant a purge sweep.
    pub fn purge_due(&self, insertions_before_purge: u64) -> bool {
        self.insertions >= insertions_before_purge
    }

    /// Drops `Received` transactions older than the keep-alive window.
    ///
    /// If a sender's lowest-nonce bucket is emptied, every higher bucket's
    /// uncommitted transactions are dropped too: without the lowest nonce
    /// they can never apply.
    pub fn purge(&mut self, current_slot: Slot, keep_alive_slots: Slot) {
        let mut removed = 0usize;
        let senders: Vec<AccountAddress> = self.accounts.keys().copied().collect();
        for sender in senders {
            removed += self.purge_account(&sender, current_slot, keep_alive_slots);
        }
        self.insertions = 0;
        if removed > 0 {
            debug!(removed, "Purged transactions");
        }
    }

    fn purge_account(
        &mut self,
        sender: &AccountAddress,
        current_slot: Slot,
        keep_alive_slots: Slot,
    ) -> usize {
        let Some(account) = self.accounts.get(sender) else {
            return 0;
        };
        let nonces: Vec<Nonce> = account.nonces.keys().copied().collect();
        let Some(&lowest) = nonces.first() else {
            return 0;
        };

        let mut removed = 0usize;
        let mut cascade = false;
        for nonce in nonces {
            let Some(account) = self.accounts.get_mut(sender) else {
                break;
            };
            let Some(bucket) = account.nonces.get(&nonce) else {
                continue;
            };
            let hashes: Vec<TransactionHash> = bucket.iter().copied().collect();
            for hash in hashes {
                let expendable = match self.transactions.get(&hash) {
                    Some((_, TransactionStatus::Received { slot })) => {
                        if cascade {
                            true
                        } else {
                            slot + keep_alive_slots < current_slot
                        }
                    }
                    // Committed and finalized entries are never purged here
                    _ => false,
                };
                if expendable {
                    self.remove_entry(&hash);
                    removed += 1;
                }
            }
            if nonce == lowest {
                let emptied = self
                    .accounts
                    .get(sender)
                    .map_or(true, |a| !a.nonces.contains_key(&nonce));
                if emptied {
                    cascade = true;
                }
            }
        }
        removed
    }

    fn remove_entry(&mut self, hash: &TransactionHash) {
        if let Some((tx, _)) = self.transactions.remove(hash) {
            if let Some(account) = self.accounts.get_mut(&tx.sender) {
                if let Some(bucket) = account.nonces.get_mut(&tx.nonce) {
                    bucket.remove(hash);
                    if bucket.is_empty() {
                        account.nonces.remove(&tx.nonce);
                    }
                }
            }
        }
    }

    /// Iterates pending transactions in `(sender, nonce)` order, starting at
    /// each sender's next nonce, skipping hashes in `exclude`. Used by the
    /// baker's greedy fill.
    pub fn pending_in_order<'a>(
        &'a self,
        exclude: &'a std::collections::HashSet<TransactionHash>,
    ) -> impl Iterator<Item = &'a Transaction> + 'a {
        self.accounts.iter().flat_map(move |(_, account)| {
            account
                .nonces
                .range(account.next_nonce..)
                .flat_map(move |(_, bucket)| {
                    bucket.iter().filter_map(move |hash| {
                        if exclude.contains(hash) {
                            return None;
                        }
                        match self.transactions.get(hash) {
                            Some((tx, TransactionStatus::Received { .. }))
                            | Some((tx, TransactionStatus::Committed { .. })) => Some(tx),
                            _ => None,
                        }
                    })
                })
        })
    }
}
