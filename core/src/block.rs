//! Block: hash del padre, transazioni e hash del block

use crate::crypto::Address;
use crate::transaction::Transaction;
use crate::{Hash, COINBASE_REWARD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Block della chain. La prima transazione è la coinbase che paga il miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Hash del block padre, assente solo per il genesis
    prev_hash: Option<Hash>,
    /// Lista delle transazioni, coinbase in testa
    transactions: Vec<Transaction>,
    /// SHA-256 su prev_hash e transazioni, zero finché non finalizzato
    hash: Hash,
}

impl Block {
    /// Crea nuovo block sopra `prev_hash` con la coinbase per `miner`.
    /// Il block va finalizzato dopo aver aggiunto le transazioni.
    pub fn new(prev_hash: Option<Hash>, miner: Address) -> Self {
        Self {
            prev_hash,
            transactions: vec![Transaction::coinbase(COINBASE_REWARD, miner)],
            hash: [0; 32],
        }
    }

    /// Crea block non finalizzato con transazioni arbitrarie, senza coinbase implicita
    pub fn with_transactions(prev_hash: Option<Hash>, transactions: Vec<Transaction>) -> Self {
        Self {
            prev_hash,
            transactions,
            hash: [0; 32],
        }
    }

    /// Crea genesis block finalizzato che paga il reward a `miner`
    pub fn genesis(miner: Address) -> Self {
        let mut block = Self::new(None, miner);
        block.finalize();
        block
    }

    /// Aggiunge una transazione in coda
    pub fn add_transaction(&mut self, tx: Transaction) {
        self.transactions.push(tx);
    }

    /// Serializzazione canonica: prev_hash (se presente) e le transazioni in ordine
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();

        if let Some(prev_hash) = &self.prev_hash {
            data.extend_from_slice(prev_hash);
        }
        for tx in &self.transactions {
            data.extend_from_slice(&tx.raw_bytes());
        }

        data
    }

    /// SHA-256 della serializzazione canonica
    pub fn compute_hash(&self) -> Hash {
        Sha256::digest(self.raw_bytes()).into()
    }

    /// Calcola e fissa l'hash del block
    pub fn finalize(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Vero se l'hash fissato corrisponde al contenuto attuale
    pub fn is_finalized(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn prev_hash(&self) -> Option<Hash> {
        self.prev_hash
    }

    /// Prima transazione, se è una coinbase
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transaction(&self, index: usize) -> Option<&Transaction> {
        self.transactions.get(index)
    }

    /// Dimensione del block in bytes
    pub fn size(&self) -> usize {
        bincode::serialize(self)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}
