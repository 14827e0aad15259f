//! In-memory chain store.
//!
//! This implementation is useful for unit tests, benchmarks, and small
//! devnets. Everything lives in `HashMap`s and `VecDeque`s; the open
//! pool keeps a side list of hashes to preserve arrival order for
//! candidate assembly.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::{Account, AccountId, Block, Hash256, Transaction};

use super::{ChainStore, RECEIVED_STASH_LIMIT};

/// In-memory implementation of [`ChainStore`].
#[derive(Default)]
pub struct InMemoryChainStore {
    open_txs: HashMap<Hash256, Transaction>,
    open_order: Vec<Hash256>,
    closed_txs: HashMap<Hash256, Transaction>,
    open_blocks: HashMap<Hash256, Block>,
    closed_blocks: HashMap<Hash256, Block>,
    /// Header-only hash -> full hash index over closed blocks.
    closed_by_header: HashMap<Hash256, Hash256>,
    last_closed: Option<Block>,
    stash: VecDeque<Block>,
    bootstrap: Vec<Transaction>,
    state: HashMap<AccountId, Account>,
    root_keys: HashMap<AccountId, Account>,
}

impl InMemoryChainStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions currently open.
    pub fn open_tx_count(&self) -> usize {
        self.open_txs.len()
    }

    /// Number of closed blocks currently stored.
    pub fn closed_block_count(&self) -> usize {
        self.closed_blocks.len()
    }
}

impl ChainStore for InMemoryChainStore {
    fn write_open_tx(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if self.open_txs.insert(hash, tx).is_none() {
            self.open_order.push(hash);
        }
    }

    fn delete_open_tx(&mut self, hash: &Hash256) {
        if self.open_txs.remove(hash).is_some() {
            self.open_order.retain(|h| h != hash);
        }
    }

    fn read_open_tx(&self, hash: &Hash256) -> Option<Transaction> {
        self.open_txs.get(hash).cloned()
    }

    fn read_mempool(&self) -> Vec<Transaction> {
        self.open_order
            .iter()
            .filter_map(|h| self.open_txs.get(h).cloned())
            .collect()
    }

    fn write_closed_tx(&mut self, tx: Transaction) {
        self.closed_txs.insert(tx.hash(), tx);
    }

    fn delete_closed_tx(&mut self, hash: &Hash256) {
        self.closed_txs.remove(hash);
    }

    fn read_closed_tx(&self, hash: &Hash256) -> Option<Transaction> {
        self.closed_txs.get(hash).cloned()
    }

    fn write_open_block(&mut self, block: Block) {
        self.open_blocks.insert(block.hash, block);
    }

    fn delete_open_block(&mut self, hash: &Hash256) {
        self.open_blocks.remove(hash);
    }

    fn read_open_block(&self, hash: &Hash256) -> Option<Block> {
        self.open_blocks.get(hash).cloned()
    }

    fn write_closed_block(&mut self, block: Block) {
        self.closed_by_header.insert(block.hash_without_tx, block.hash);
        self.closed_blocks.insert(block.hash, block);
    }

    fn delete_closed_block(&mut self, hash: &Hash256) {
        if let Some(block) = self.closed_blocks.remove(hash) {
            self.closed_by_header.remove(&block.hash_without_tx);
        }
    }

    fn read_closed_block(&self, hash: &Hash256) -> Option<Block> {
        self.closed_blocks.get(hash).cloned()
    }

    fn read_closed_block_without_tx(&self, hash_without_tx: &Hash256) -> Option<Block> {
        let full = self.closed_by_header.get(hash_without_tx)?;
        self.closed_blocks.get(full).cloned()
    }

    fn read_all_closed_blocks(&self) -> Vec<Block> {
        self.closed_blocks.values().cloned().collect()
    }

    fn write_last_closed_block(&mut self, block: Block) {
        self.last_closed = Some(block);
    }

    fn delete_all_last_closed_block(&mut self) {
        self.last_closed = None;
    }

    fn read_last_closed_block(&self) -> Option<Block> {
        self.last_closed.clone()
    }

    fn write_to_received_stash(&mut self, block: Block) {
        if self.stash.iter().any(|b| b.hash == block.hash) {
            return;
        }
        self.stash.push_back(block);
        if self.stash.len() > RECEIVED_STASH_LIMIT {
            self.stash.pop_front();
        }
    }

    fn read_received_block_stash(&self) -> Vec<Block> {
        self.stash.iter().cloned().collect()
    }

    fn write_bootstrap_received_tx(&mut self, tx: Transaction) {
        self.bootstrap.push(tx);
    }

    fn read_all_bootstrap_received_transactions(&self) -> Vec<Transaction> {
        self.bootstrap.clone()
    }

    fn delete_bootstrap_received_mempool(&mut self) {
        self.bootstrap.clear();
    }

    fn account(&self, id: &AccountId) -> Option<Account> {
        self.state.get(id).cloned()
    }

    fn put_account(&mut self, acc: Account) {
        self.state.insert(acc.id(), acc);
    }

    fn remove_account(&mut self, id: &AccountId) {
        self.state.remove(id);
    }

    fn root_account(&self, id: &AccountId) -> Option<Account> {
        self.root_keys.get(id).cloned()
    }

    fn put_root_account(&mut self, acc: Account) {
        self.root_keys.insert(acc.id(), acc);
    }

    fn root_account_ids(&self) -> Vec<AccountId> {
        self.root_keys.keys().copied().collect()
    }

    fn state_snapshot(&self) -> BTreeMap<AccountId, Account> {
        self.state
            .iter()
            .map(|(id, acc)| (*id, acc.clone()))
            .collect()
    }
}
