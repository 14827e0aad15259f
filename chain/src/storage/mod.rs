//! Storage abstraction used by the consensus engine.
//!
//! The engine sees one typed key/value interface covering transactions
//! (open and closed), blocks (open, closed, closed-by-header-hash),
//! the last closed block, the received-block stash, the bootstrap
//! mempool and the account state. Implementations can be backed by
//! in-memory maps, RocksDB, etc.

use std::collections::BTreeMap;

use crate::types::{Account, AccountId, Block, Hash256, Transaction};

mod mem;
mod rocksdb;

pub use mem::InMemoryChainStore;
pub use rocksdb::{RocksDbChainStore, RocksDbConfig, StorageError};

/// How many blocks the received stash retains before evicting the oldest.
pub const RECEIVED_STASH_LIMIT: usize = 100;

/// Typed storage interface used by the consensus engine.
///
/// All operations are synchronous; callers serialize access through the
/// block-validation latch.
pub trait ChainStore {
    // --- open transactions (the mempool) ---

    /// Adds a transaction to the open pool. Arrival order is preserved
    /// for candidate assembly.
    fn write_open_tx(&mut self, tx: Transaction);
    fn delete_open_tx(&mut self, hash: &Hash256);
    fn read_open_tx(&self, hash: &Hash256) -> Option<Transaction>;
    /// All open transactions in arrival (FIFO) order.
    fn read_mempool(&self) -> Vec<Transaction>;

    // --- closed transactions ---

    fn write_closed_tx(&mut self, tx: Transaction);
    fn delete_closed_tx(&mut self, hash: &Hash256);
    fn read_closed_tx(&self, hash: &Hash256) -> Option<Transaction>;

    // --- open blocks (staging during sync) ---

    fn write_open_block(&mut self, block: Block);
    fn delete_open_block(&mut self, hash: &Hash256);
    fn read_open_block(&self, hash: &Hash256) -> Option<Block>;

    // --- closed blocks ---

    /// Persists a validated block, indexed by both its full hash and its
    /// header-only hash.
    fn write_closed_block(&mut self, block: Block);
    fn delete_closed_block(&mut self, hash: &Hash256);
    fn read_closed_block(&self, hash: &Hash256) -> Option<Block>;
    fn read_closed_block_without_tx(&self, hash_without_tx: &Hash256) -> Option<Block>;
    fn read_all_closed_blocks(&self) -> Vec<Block>;

    // --- head bookkeeping ---

    fn write_last_closed_block(&mut self, block: Block);
    fn delete_all_last_closed_block(&mut self);
    fn read_last_closed_block(&self) -> Option<Block>;

    // --- received stash ---

    /// Retains a block seen off the active chain so later reorgs can
    /// rediscover it. Bounded to [`RECEIVED_STASH_LIMIT`] entries.
    fn write_to_received_stash(&mut self, block: Block);
    fn read_received_block_stash(&self) -> Vec<Block>;

    // --- bootstrap mempool ---

    fn write_bootstrap_received_tx(&mut self, tx: Transaction);
    fn read_all_bootstrap_received_transactions(&self) -> Vec<Transaction>;
    fn delete_bootstrap_received_mempool(&mut self);

    // --- world state ---

    fn account(&self, id: &AccountId) -> Option<Account>;
    /// Inserts or replaces an account, keyed by its address hash.
    fn put_account(&mut self, acc: Account);
    fn remove_account(&mut self, id: &AccountId);

    fn root_account(&self, id: &AccountId) -> Option<Account>;
    fn put_root_account(&mut self, acc: Account);
    fn root_account_ids(&self) -> Vec<AccountId>;

    /// Deterministically ordered copy of the whole account state.
    fn state_snapshot(&self) -> BTreeMap<AccountId, Account>;
}
