//! Forkledger Core - Strutture dati fondamentali del ledger UTXO

// Re-export dei moduli principali
pub mod block;
pub mod crypto;
pub mod transaction;
pub mod utxo;
pub mod validation;

// Re-export dei tipi principali
pub use block::Block;
pub use crypto::{Address, CryptoError, SigningKey};
pub use transaction::{OutputLock, SpendProof, Transaction, TransactionError, TxInput, TxOutput};
pub use utxo::{Utxo, UtxoPool};
pub use validation::{apply_batch, check_transaction, fee, is_valid, BatchOutcome, RejectedTx, TxHandler, ValidationError};

/// Hash SHA-256 (transazioni e blocchi)
pub type Hash = [u8; 32];

/// Reward della coinbase per ogni blocco
pub const COINBASE_REWARD: f64 = 3.125;

/// Tolleranza nel confronto tra somma della coinbase e reward
pub const COINBASE_TOLERANCE: f64 = 0.00001;

/// Firme distinte richieste per spendere un output multisig
pub const MULTISIG_THRESHOLD: usize = 2;

/// Ritardo massimo (in altezza) di un ramo rispetto al leader corrente
pub const CUT_OFF_AGE: u64 = 12;

/// Numero massimo di blocchi indicizzati in memoria (FIFO di inserimento)
pub const MAX_BLOCKS_IN_MEMORY: usize = 100;

/// Formatta i primi byte di un hash per i log
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(COINBASE_REWARD, 3.125);
        assert_eq!(MULTISIG_THRESHOLD, 2);
        assert_eq!(CUT_OFF_AGE, 12);
        assert_eq!(MAX_BLOCKS_IN_MEMORY, 100);
    }

    #[test]
    fn test_short_hash() {
        let hash = [0xab; 32];
        assert_eq!(short_hash(&hash), "abababababababab");
    }
}
