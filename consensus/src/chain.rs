//! Block tree with fork resolution, pruning and bounded memory

use crate::config::{ChainConfig, ConfigError, SelectionPolicy};
use crate::mempool::{MempoolError, TransactionPool};
use forkledger_core::transaction::current_timestamp;
use forkledger_core::{
    apply_batch, fee, short_hash, Address, Block, Hash, Transaction, Utxo, UtxoPool, ValidationError,
    COINBASE_REWARD, COINBASE_TOLERANCE,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Slot of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

/// A block with its position in the tree and the ledger state after it
#[derive(Debug)]
pub struct BlockNode {
    block: Block,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    height: u64,
    utxo_pool: UtxoPool,
}

impl BlockNode {
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Genesis is height 1
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Spendable set immediately after this block
    pub fn utxo_pool(&self) -> &UtxoPool {
        &self.utxo_pool
    }
}

/// Chain statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStats {
    /// Height of the leading blocks
    pub max_height: u64,
    /// Number of blocks tied at max height
    pub leaders: usize,
    /// Blocks reachable by hash
    pub indexed_blocks: usize,
    /// Transactions waiting for a block
    pub pending_transactions: usize,
}

/// Tree of blocks rooted at genesis.
///
/// Nodes live in an arena; the hash index only covers the last
/// `max_blocks_in_memory` inserted blocks. A node dropped from the index
/// keeps its slot and links until it is pruned, or until it is no longer a
/// leader and has fallen `cut_off_age` blocks behind the max height.
#[derive(Debug)]
pub struct Blockchain {
    nodes: Vec<Option<BlockNode>>,
    free_slots: Vec<usize>,
    index: HashMap<Hash, NodeId>,
    /// Nodes dropped from the index but still in the arena
    evicted: Vec<NodeId>,
    /// Leaders tied at max height, in insertion order; never empty
    max_height_nodes: Vec<NodeId>,
    /// Insertion-order FIFO driving eviction
    recent_blocks: VecDeque<Hash>,
    tx_pool: TransactionPool,
    config: ChainConfig,
}

impl Blockchain {
    /// Create a chain from a finalized genesis block.
    ///
    /// Genesis has no parent and contains only coinbase transactions; their
    /// outputs form the initial UTXO pool.
    pub fn new(genesis: Block, config: ChainConfig) -> Result<Self, ChainError> {
        config.validate()?;

        if genesis.prev_hash().is_some() {
            return Err(ChainError::InvalidGenesis("genesis must not have a parent".to_string()));
        }
        if genesis.transactions().is_empty() {
            return Err(ChainError::InvalidGenesis("genesis has no coinbase".to_string()));
        }
        if genesis.transactions().iter().any(|tx| !tx.is_coinbase()) {
            return Err(ChainError::InvalidGenesis(
                "genesis may only contain coinbase transactions".to_string(),
            ));
        }
        if !genesis.is_finalized() || genesis.transactions().iter().any(|tx| !tx.is_finalized()) {
            return Err(ChainError::InvalidGenesis("genesis is not finalized".to_string()));
        }

        let mut utxo_pool = UtxoPool::new();
        for tx in genesis.transactions() {
            for (index, output) in tx.outputs.iter().enumerate() {
                utxo_pool.put(Utxo::new(tx.hash(), index as u32), output.clone());
            }
        }

        let genesis_hash = genesis.hash();
        let root = BlockNode {
            block: genesis,
            parent: None,
            children: Vec::new(),
            height: 1,
            utxo_pool,
        };

        let mut chain = Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            evicted: Vec::new(),
            max_height_nodes: Vec::new(),
            recent_blocks: VecDeque::new(),
            tx_pool: TransactionPool::new(),
            config,
        };

        let id = chain.alloc(root);
        chain.index.insert(genesis_hash, id);
        chain.max_height_nodes.push(id);
        chain.recent_blocks.push_back(genesis_hash);

        log::info!("Chain initialized with genesis {}", short_hash(&genesis_hash));
        Ok(chain)
    }

    /// Validate and attach `block` to the tree.
    ///
    /// The block is atomic: every transaction must be valid against the
    /// parent's pool, applied in order. On rejection nothing changes.
    pub fn submit_block(&mut self, block: Block) -> Result<(), ChainError> {
        let block_hash = block.hash();

        let prev_hash = block.prev_hash().ok_or(ChainError::MissingPrevHash)?;

        if !block.is_finalized() {
            return Err(ChainError::HashMismatch { hash: block_hash });
        }

        if self.index.contains_key(&block_hash) {
            return Err(ChainError::Duplicate { hash: block_hash });
        }

        let parent_id = self
            .index
            .get(&prev_hash)
            .copied()
            .ok_or(ChainError::UnknownParent { prev_hash })?;
        let parent = self.node(parent_id).ok_or(ChainError::UnknownParent { prev_hash })?;

        let height = parent.height + 1;
        let max_height = self.max_height();
        if height.saturating_add(self.config.cut_off_age) <= max_height {
            return Err(ChainError::TooOld { height, max_height });
        }

        let coinbase = match block.transactions().first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => return Err(ChainError::MissingCoinbase),
        };
        if let Some(position) = block.transactions().iter().skip(1).position(Transaction::is_coinbase) {
            return Err(ChainError::MisplacedCoinbase { index: position + 1 });
        }
        if let Some(index) = block.transactions().iter().position(|tx| !tx.is_finalized()) {
            return Err(ChainError::TransactionHashMismatch { index });
        }

        // coinbase timestamps strictly increase along a branch, so an
        // ancestor's coinbase can never be confirmed again
        let parent_timestamp = latest_coinbase_timestamp(&parent.block);
        if coinbase.timestamp <= parent_timestamp {
            return Err(ChainError::StaleCoinbase {
                timestamp: coinbase.timestamp,
                parent_timestamp,
            });
        }
        if let Some((index, output)) = coinbase
            .outputs
            .iter()
            .enumerate()
            .find(|(_, output)| !(output.value >= 0.0))
        {
            return Err(ChainError::NegativeCoinbaseOutput {
                index,
                value: output.value,
            });
        }

        let outcome = apply_batch(block.transactions(), &parent.utxo_pool);
        if let Some(rejected) = outcome.rejected.into_iter().next() {
            return Err(ChainError::InvalidTransaction {
                index: rejected.position,
                source: rejected.reason,
            });
        }

        let coinbase_value = coinbase.output_value();
        if !((coinbase_value - COINBASE_REWARD).abs() <= COINBASE_TOLERANCE) {
            return Err(ChainError::CoinbaseValue { value: coinbase_value });
        }

        let confirmed: Vec<Hash> = block.transactions().iter().map(Transaction::hash).collect();

        let id = self.alloc(BlockNode {
            block,
            parent: Some(parent_id),
            children: Vec::new(),
            height,
            utxo_pool: outcome.pool,
        });
        if let Some(parent) = self.node_mut(parent_id) {
            parent.children.push(id);
        }
        self.index.insert(block_hash, id);
        self.recent_blocks.push_back(block_hash);

        log::info!(
            "Accepted block {} at height {} ({} transactions)",
            short_hash(&block_hash),
            height,
            confirmed.len()
        );

        self.update_max_height(id, height, max_height);
        self.evict();

        for tx_hash in &confirmed {
            self.tx_pool.remove(tx_hash);
        }
        self.drop_stale_pending();

        Ok(())
    }

    /// Assemble, submit and return a block on top of the first leader.
    ///
    /// Pending transactions are offered to the batch handler in the order of
    /// the configured `SelectionPolicy`; those that do not fit the leader's
    /// pool stay pending until a block confirms a conflicting spend.
    pub fn create_block(&mut self, miner: &Address) -> Result<Block, ChainError> {
        let parent = self.leader().ok_or(ChainError::EmptyChain)?;
        let candidates = self.ordered_pending(&parent.utxo_pool);
        let outcome = apply_batch(&candidates, &parent.utxo_pool);

        let timestamp = current_timestamp().max(latest_coinbase_timestamp(&parent.block).saturating_add(1));
        let coinbase = Transaction::coinbase_at(COINBASE_REWARD, *miner, timestamp);
        let mut block = Block::with_transactions(Some(parent.block.hash()), vec![coinbase]);
        for tx in outcome.accepted {
            block.add_transaction(tx);
        }
        block.finalize();

        self.submit_block(block.clone())?;

        log::info!(
            "Assembled block {} with {} of {} pending transactions",
            short_hash(&block.hash()),
            block.transactions().len() - 1,
            candidates.len()
        );
        Ok(block)
    }

    /// Validate `tx` against the leading pool and add it to the pending pool
    pub fn add_pending_transaction(&mut self, tx: Transaction) -> Result<Hash, MempoolError> {
        let pool = self.utxo_pool_at_max_height().unwrap_or_default();
        let result = self.tx_pool.admit(tx, &pool);

        if let Err(e) = &result {
            log::debug!("Pending transaction rejected: {}", e);
        }
        result
    }

    /// First leader's block
    pub fn block_at_max_height(&self) -> Option<&Block> {
        self.leader().map(BlockNode::block)
    }

    /// Copy of the first leader's pool
    pub fn utxo_pool_at_max_height(&self) -> Option<UtxoPool> {
        self.leader().map(|node| node.utxo_pool.clone())
    }

    pub fn max_height(&self) -> u64 {
        self.leader().map(BlockNode::height).unwrap_or(0)
    }

    /// Blocks tied at max height, in insertion order
    pub fn max_height_blocks(&self) -> Vec<&Block> {
        self.max_height_nodes
            .iter()
            .filter_map(|id| self.node(*id))
            .map(BlockNode::block)
            .collect()
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&Block> {
        self.indexed_node(hash).map(BlockNode::block)
    }

    pub fn get_node(&self, hash: &Hash) -> Option<&BlockNode> {
        self.indexed_node(hash)
    }

    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn transaction_pool(&self) -> &TransactionPool {
        &self.tx_pool
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            max_height: self.max_height(),
            leaders: self.max_height_nodes.len(),
            indexed_blocks: self.index.len(),
            pending_transactions: self.tx_pool.len(),
        }
    }

    fn leader(&self) -> Option<&BlockNode> {
        self.max_height_nodes.first().and_then(|id| self.node(*id))
    }

    fn indexed_node(&self, hash: &Hash) -> Option<&BlockNode> {
        self.index.get(hash).and_then(|id| self.node(*id))
    }

    fn node(&self, id: NodeId) -> Option<&BlockNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut BlockNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: BlockNode) -> NodeId {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Free the slot and unlink the node; its children lose their parent
    fn release(&mut self, id: NodeId) -> Option<BlockNode> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.free_slots.push(id.0);

        if let Some(parent) = node.parent.and_then(|parent| self.node_mut(parent)) {
            parent.children.retain(|child| *child != id);
        }
        for child in &node.children {
            if let Some(child) = self.node_mut(*child) {
                child.parent = None;
            }
        }

        Some(node)
    }

    /// A strictly taller block becomes the sole leader and every previous
    /// leader except its parent is pruned. All nodes at the old max height
    /// are leaders, so this removes each losing tip at that height.
    fn update_max_height(&mut self, id: NodeId, height: u64, max_height: u64) {
        if height > max_height {
            let previous = std::mem::replace(&mut self.max_height_nodes, vec![id]);
            let parent = self.node(id).and_then(|node| node.parent);

            for leader in previous {
                if Some(leader) == parent {
                    continue;
                }
                let hash = self.node(leader).map(|node| node.block.hash());
                let removed = self.prune(leader);
                if let Some(hash) = hash {
                    log::info!("Pruned fork at {} ({} blocks)", short_hash(&hash), removed);
                }
            }

            log::info!("New leader at height {}", height);
        } else if height == max_height {
            self.max_height_nodes.push(id);
            log::debug!("Block tied at max height {} ({} leaders)", height, self.max_height_nodes.len());
        }
    }

    /// Remove `id` and its whole subtree, children first. Returns the node count.
    fn prune(&mut self, id: NodeId) -> usize {
        let children = match self.node(id) {
            Some(node) => node.children.clone(),
            None => return 0,
        };

        let mut removed = 0;
        for child in children {
            removed += self.prune(child);
        }

        if let Some(node) = self.release(id) {
            let hash = node.block.hash();
            if self.index.get(&hash) == Some(&id) {
                self.index.remove(&hash);
            }
            self.recent_blocks.retain(|recent| *recent != hash);
            self.max_height_nodes.retain(|leader| *leader != id);
            self.evicted.retain(|evicted| *evicted != id);
            removed += 1;
        }

        removed
    }

    /// Drop the oldest hashes from the index; the nodes stay in the arena
    fn evict(&mut self) {
        while self.recent_blocks.len() > self.config.max_blocks_in_memory {
            let Some(hash) = self.recent_blocks.pop_front() else {
                break;
            };
            let Some(id) = self.index.remove(&hash) else {
                continue;
            };

            if self.max_height_nodes.contains(&id) {
                log::warn!("Evicted block {} is still a max-height leader", short_hash(&hash));
            } else {
                log::debug!("Evicted block {}", short_hash(&hash));
            }
            self.evicted.push(id);
        }

        self.release_stale();
    }

    /// Free evicted nodes that are not leaders and sit behind the cut-off window
    fn release_stale(&mut self) {
        let max_height = self.max_height();
        let cut_off_age = self.config.cut_off_age;

        let (stale, kept): (Vec<NodeId>, Vec<NodeId>) = self.evicted.iter().copied().partition(|id| {
            !self.max_height_nodes.contains(id)
                && self
                    .node(*id)
                    .map(|node| node.height.saturating_add(cut_off_age) <= max_height)
                    .unwrap_or(true)
        });

        self.evicted = kept;
        for id in stale {
            self.release(id);
        }
    }

    fn drop_stale_pending(&mut self) {
        let Some(leader) = self
            .max_height_nodes
            .first()
            .and_then(|id| self.nodes.get(id.0))
            .and_then(Option::as_ref)
        else {
            return;
        };

        let dropped = self.tx_pool.retain_valid(&leader.utxo_pool);
        if dropped > 0 {
            log::debug!("Dropped {} pending transactions invalid on the leading branch", dropped);
        }
    }

    fn ordered_pending(&self, pool: &UtxoPool) -> Vec<Transaction> {
        let pending = self.tx_pool.transactions();

        match self.config.selection {
            SelectionPolicy::InsertionOrder => pending,
            SelectionPolicy::FeeDescending => {
                let mut keyed: Vec<(Option<f64>, Transaction)> =
                    pending.into_iter().map(|tx| (fee(&tx, pool), tx)).collect();

                // unknown fees (missing inputs) go last; the sort is stable
                keyed.sort_by(|a, b| match (a.0, b.0) {
                    (Some(x), Some(y)) => y.total_cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
                keyed.into_iter().map(|(_, tx)| tx).collect()
            }
        }
    }
}

/// Latest coinbase timestamp in `block`; genesis may hold several coinbases
fn latest_coinbase_timestamp(block: &Block) -> u64 {
    block
        .transactions()
        .iter()
        .filter(|tx| tx.is_coinbase())
        .map(|tx| tx.timestamp)
        .max()
        .unwrap_or(0)
}

/// Block rejection reasons
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("Block has no parent hash")]
    MissingPrevHash,

    #[error("Block hash {} does not match its content", hex::encode(.hash))]
    HashMismatch { hash: Hash },

    #[error("Block {} already in chain", hex::encode(.hash))]
    Duplicate { hash: Hash },

    #[error("Unknown parent block {}", hex::encode(.prev_hash))]
    UnknownParent { prev_hash: Hash },

    #[error("Block at height {height} is too far behind max height {max_height}")]
    TooOld { height: u64, max_height: u64 },

    #[error("First transaction is not a coinbase")]
    MissingCoinbase,

    #[error("Coinbase transaction at position {index}")]
    MisplacedCoinbase { index: usize },

    #[error("Transaction {index} hash does not match its content")]
    TransactionHashMismatch { index: usize },

    #[error("Transaction {index} rejected: {source}")]
    InvalidTransaction { index: usize, source: ValidationError },

    #[error("Coinbase pays {value}, expected {}", COINBASE_REWARD)]
    CoinbaseValue { value: f64 },

    #[error("Coinbase output {index} has invalid value {value}")]
    NegativeCoinbaseOutput { index: usize, value: f64 },

    #[error("Coinbase timestamp {timestamp} is not after parent coinbase {parent_timestamp}")]
    StaleCoinbase { timestamp: u64, parent_timestamp: u64 },

    #[error("Invalid genesis block: {0}")]
    InvalidGenesis(String),

    #[error("Chain has no leading block")]
    EmptyChain,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
