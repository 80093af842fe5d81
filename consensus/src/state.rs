//! Thread-safe ledger handle

use crate::chain::{Blockchain, ChainError, ChainStats};
use crate::config::{ChainConfig, ConfigError};
use crate::mempool::MempoolError;
use forkledger_core::{short_hash, Address, Block, Hash, Transaction, UtxoPool};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Shared handle over one `Blockchain`.
///
/// Every operation runs under a single mutex, so a block submission
/// (parent lookup, batch apply, insert, leader update, eviction, pending
/// cleanup) is atomic with respect to concurrent callers.
pub struct Ledger {
    chain: Mutex<Blockchain>,
}

impl Ledger {
    /// Create ledger with default configuration
    pub fn new(genesis: Block) -> Result<Self, LedgerError> {
        Self::with_config(genesis, ChainConfig::default())
    }

    /// Create ledger with custom configuration
    pub fn with_config(genesis: Block, config: ChainConfig) -> Result<Self, LedgerError> {
        let chain = Blockchain::new(genesis, config)?;
        Ok(Self {
            chain: Mutex::new(chain),
        })
    }

    /// Create ledger from a JSON configuration document
    pub fn from_json_config(genesis: Block, json: &str) -> Result<Self, LedgerError> {
        let config = ChainConfig::from_json_str(json)?;
        Self::with_config(genesis, config)
    }

    // Mutations are validated before they are applied, so a poisoned
    // lock still guards a consistent chain.
    fn chain(&self) -> MutexGuard<'_, Blockchain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate against the leading branch and queue the transaction
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash, LedgerError> {
        let hash = self.chain().add_pending_transaction(tx)?;
        log::debug!("Queued transaction {}", short_hash(&hash));
        Ok(hash)
    }

    pub fn submit_block(&self, block: Block) -> Result<(), LedgerError> {
        self.chain().submit_block(block)?;
        Ok(())
    }

    /// Assemble a block on the leading branch, paying the reward to `miner`
    pub fn create_block(&self, miner: &Address) -> Result<Block, LedgerError> {
        Ok(self.chain().create_block(miner)?)
    }

    /// Snapshot of the leading branch's spendable outputs
    pub fn current_leading_utxo_pool(&self) -> UtxoPool {
        self.chain().utxo_pool_at_max_height().unwrap_or_default()
    }

    /// Pending transactions in admission order
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.chain().transaction_pool().transactions()
    }

    pub fn leading_block(&self) -> Option<Block> {
        self.chain().block_at_max_height().cloned()
    }

    pub fn get_block(&self, hash: &Hash) -> Option<Block> {
        self.chain().get_block(hash).cloned()
    }

    pub fn max_height(&self) -> u64 {
        self.chain().max_height()
    }

    pub fn stats(&self) -> ChainStats {
        self.chain().stats()
    }
}

/// Ledger errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Block rejected: {0}")]
    Chain(#[from] ChainError),

    #[error("Transaction rejected: {0}")]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
