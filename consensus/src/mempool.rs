//! Pending transaction pool

use forkledger_core::{check_transaction, is_valid, short_hash, Hash, Transaction, UtxoPool, ValidationError};
use std::collections::HashMap;

/// Admitted transaction with its admission sequence number
#[derive(Debug, Clone)]
struct PendingEntry {
    seq: u64,
    tx: Transaction,
}

/// Globally pending transactions, keyed by hash.
///
/// Not branch-scoped: admission checks a transaction against the leading
/// branch at that moment, and nothing is reserved. Conflicts are resolved
/// when a block is assembled; losers are dropped once a block confirms
/// the spend they conflicted with.
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    entries: HashMap<Hash, PendingEntry>,
    next_seq: u64,
}

impl TransactionPool {
    /// Create empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `tx` against `pool` and admit it.
    /// Coinbase transactions are only ever created by block assembly.
    pub fn admit(&mut self, tx: Transaction, pool: &UtxoPool) -> Result<Hash, MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::CoinbaseNotAllowed);
        }

        if !tx.is_finalized() {
            return Err(MempoolError::HashMismatch {
                hash: tx.hash(),
            });
        }

        check_transaction(&tx, pool)?;
        Ok(self.add(tx))
    }

    /// Insert without validation; a transaction already present keeps its position
    pub fn add(&mut self, tx: Transaction) -> Hash {
        let hash = tx.hash();

        if !self.entries.contains_key(&hash) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(hash, PendingEntry { seq, tx });
            log::debug!("Transaction {} added to pending pool", short_hash(&hash));
        }

        hash
    }

    /// Drop every transaction that is no longer valid against `pool`.
    /// Returns how many were dropped.
    pub fn retain_valid(&mut self, pool: &UtxoPool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| is_valid(&entry.tx, pool));
        before - self.entries.len()
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        self.entries.remove(hash).map(|entry| entry.tx)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.entries.get(hash).map(|entry| &entry.tx)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// All pending transactions in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut entries: Vec<&PendingEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.tx.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pending transaction rejections
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MempoolError {
    #[error("Coinbase transactions not allowed in mempool")]
    CoinbaseNotAllowed,

    #[error("Transaction hash {} does not match its content", hex::encode(.hash))]
    HashMismatch { hash: Hash },

    #[error("Invalid transaction: {0}")]
    Invalid(#[from] ValidationError),
}
