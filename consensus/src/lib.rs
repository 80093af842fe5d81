//! Forkledger Consensus - block tree, fork resolution and pending pool

pub mod chain;
pub mod config;
pub mod mempool;
pub mod state;

pub use chain::{BlockNode, Blockchain, ChainError, ChainStats};
pub use config::{ChainConfig, ChainConfigBuilder, ConfigError, SelectionPolicy};
pub use mempool::{MempoolError, TransactionPool};
pub use state::{Ledger, LedgerError};
