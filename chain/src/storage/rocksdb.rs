//! RocksDB-backed chain store.
//!
//! The durable part of the chain (closed transactions, closed blocks and
//! the last-closed marker) is persisted in dedicated column families:
//!
//! - `"closed_txs"`:    tx content hash (32 bytes) -> canonical tx bytes,
//! - `"closed_blocks"`: block hash (32 bytes) -> canonical block bytes,
//! - `"blocks_by_header"`: header-only hash -> full block hash,
//! - `"meta"`:          the last closed block under the key `"last_closed"`.
//!
//! The transient maps (open pools, received stash, bootstrap mempool and
//! account state) stay in memory: the mempool refills from gossip and the
//! account state is reproducible by replaying the persisted chain.

use std::collections::BTreeMap;
use std::{path::Path, sync::Arc};

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DB, Options};

use crate::types::{Account, AccountId, Block, Hash256, Transaction};

use super::{ChainStore, InMemoryChainStore};

/// Configuration for [`RocksDbChainStore`].
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if
    /// they do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/chain-db".to_string(),
            create_if_missing: true,
        }
    }
}

/// Storage-level error type.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying RocksDB error.
    RocksDb(rocksdb::Error),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::RocksDb(e)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::RocksDb(e) => write!(f, "rocksdb error: {e}"),
            StorageError::MissingColumnFamily(name) => {
                write!(f, "missing column family: {name}")
            }
        }
    }
}

impl std::error::Error for StorageError {}

/// RocksDB-backed implementation of [`ChainStore`].
pub struct RocksDbChainStore {
    db: DB,
    transient: InMemoryChainStore,
}

impl RocksDbChainStore {
    /// Opens (or creates) a RocksDB-backed chain store at the given path.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new("closed_txs", Options::default()),
            ColumnFamilyDescriptor::new("closed_blocks", Options::default()),
            ColumnFamilyDescriptor::new("blocks_by_header", Options::default()),
            ColumnFamilyDescriptor::new("meta", Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db,
            transient: InMemoryChainStore::new(),
        })
    }

    fn cf(&self, name: &'static str) -> Option<Arc<BoundColumnFamily<'_>>> {
        let handle = self.db.cf_handle(name);
        if handle.is_none() {
            tracing::error!(name, "missing column family");
        }
        handle
    }

    fn get_block_cf(&self, cf_name: &'static str, key: &[u8]) -> Option<Block> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key) {
            Ok(Some(bytes)) => Block::decode(&bytes),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(error = %e, cf = cf_name, "block read failed");
                None
            }
        }
    }

    fn put_cf_logged(&self, cf_name: &'static str, key: &[u8], value: &[u8]) {
        if let Some(cf) = self.cf(cf_name) {
            if let Err(e) = self.db.put_cf(&cf, key, value) {
                tracing::error!(error = %e, cf = cf_name, "write failed");
            }
        }
    }

    fn delete_cf_logged(&self, cf_name: &'static str, key: &[u8]) {
        if let Some(cf) = self.cf(cf_name) {
            if let Err(e) = self.db.delete_cf(&cf, key) {
                tracing::error!(error = %e, cf = cf_name, "delete failed");
            }
        }
    }
}

impl ChainStore for RocksDbChainStore {
    fn write_open_tx(&mut self, tx: Transaction) {
        self.transient.write_open_tx(tx);
    }

    fn delete_open_tx(&mut self, hash: &Hash256) {
        self.transient.delete_open_tx(hash);
    }

    fn read_open_tx(&self, hash: &Hash256) -> Option<Transaction> {
        self.transient.read_open_tx(hash)
    }

    fn read_mempool(&self) -> Vec<Transaction> {
        self.transient.read_mempool()
    }

    fn write_closed_tx(&mut self, tx: Transaction) {
        self.put_cf_logged("closed_txs", tx.hash().as_bytes(), &tx.encode());
    }

    fn delete_closed_tx(&mut self, hash: &Hash256) {
        self.delete_cf_logged("closed_txs", hash.as_bytes());
    }

    fn read_closed_tx(&self, hash: &Hash256) -> Option<Transaction> {
        let cf = self.cf("closed_txs")?;
        match self.db.get_cf(&cf, hash.as_bytes()) {
            Ok(Some(bytes)) => Transaction::decode(&bytes),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(error = %e, "closed tx read failed");
                None
            }
        }
    }

    fn write_open_block(&mut self, block: Block) {
        self.transient.write_open_block(block);
    }

    fn delete_open_block(&mut self, hash: &Hash256) {
        self.transient.delete_open_block(hash);
    }

    fn read_open_block(&self, hash: &Hash256) -> Option<Block> {
        self.transient.read_open_block(hash)
    }

    fn write_closed_block(&mut self, block: Block) {
        self.put_cf_logged(
            "blocks_by_header",
            block.hash_without_tx.as_bytes(),
            block.hash.as_bytes(),
        );
        self.put_cf_logged("closed_blocks", block.hash.as_bytes(), &block.encode());
    }

    fn delete_closed_block(&mut self, hash: &Hash256) {
        if let Some(block) = self.read_closed_block(hash) {
            self.delete_cf_logged("blocks_by_header", block.hash_without_tx.as_bytes());
            self.delete_cf_logged("closed_blocks", hash.as_bytes());
        }
    }

    fn read_closed_block(&self, hash: &Hash256) -> Option<Block> {
        self.get_block_cf("closed_blocks", hash.as_bytes())
    }

    fn read_closed_block_without_tx(&self, hash_without_tx: &Hash256) -> Option<Block> {
        let cf = self.cf("blocks_by_header")?;
        let full = match self.db.get_cf(&cf, hash_without_tx.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            _ => return None,
        };
        self.get_block_cf("closed_blocks", &full)
    }

    fn read_all_closed_blocks(&self) -> Vec<Block> {
        let Some(cf) = self.cf("closed_blocks") else {
            return Vec::new();
        };
        self.db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .filter_map(|entry| entry.ok())
            .filter_map(|(_, bytes)| Block::decode(&bytes))
            .collect()
    }

    fn write_last_closed_block(&mut self, block: Block) {
        self.put_cf_logged("meta", b"last_closed", &block.encode());
    }

    fn delete_all_last_closed_block(&mut self) {
        self.delete_cf_logged("meta", b"last_closed");
    }

    fn read_last_closed_block(&self) -> Option<Block> {
        self.get_block_cf("meta", b"last_closed")
    }

    fn write_to_received_stash(&mut self, block: Block) {
        self.transient.write_to_received_stash(block);
    }

    fn read_received_block_stash(&self) -> Vec<Block> {
        self.transient.read_received_block_stash()
    }

    fn write_bootstrap_received_tx(&mut self, tx: Transaction) {
        self.transient.write_bootstrap_received_tx(tx);
    }

    fn read_all_bootstrap_received_transactions(&self) -> Vec<Transaction> {
        self.transient.read_all_bootstrap_received_transactions()
    }

    fn delete_bootstrap_received_mempool(&mut self) {
        self.transient.delete_bootstrap_received_mempool();
    }

    fn account(&self, id: &AccountId) -> Option<Account> {
        self.transient.account(id)
    }

    fn put_account(&mut self, acc: Account) {
        self.transient.put_account(acc);
    }

    fn remove_account(&mut self, id: &AccountId) {
        self.transient.remove_account(id);
    }

    fn root_account(&self, id: &AccountId) -> Option<Account> {
        self.transient.root_account(id)
    }

    fn put_root_account(&mut self, acc: Account) {
        self.transient.put_root_account(acc);
    }

    fn root_account_ids(&self) -> Vec<AccountId> {
        self.transient.root_account_ids()
    }

    fn state_snapshot(&self) -> BTreeMap<AccountId, Account> {
        self.transient.state_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, FundsTx, HASH_LEN, Sig};
    use tempfile::TempDir;

    fn dummy_hash(byte: u8) -> Hash256 {
        Hash256([byte; HASH_LEN])
    }

    fn dummy_block(height: u32) -> Block {
        let mut b = Block::new(dummy_hash(0), dummy_hash(0), Sig::default(), height);
        b.timestamp = 1_700_000_000 + height as i64;
        b.seal();
        b
    }

    fn open_store(tmp: &TempDir) -> RocksDbChainStore {
        let cfg = RocksDbConfig {
            path: tmp.path().to_string_lossy().to_string(),
            create_if_missing: true,
        };
        RocksDbChainStore::open(&cfg).expect("open RocksDB")
    }

    #[test]
    fn closed_block_roundtrip_with_both_indexes() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut store = open_store(&tmp);

        let b = dummy_block(1);
        store.write_closed_block(b.clone());

        assert_eq!(store.read_closed_block(&b.hash), Some(b.clone()));
        assert_eq!(
            store.read_closed_block_without_tx(&b.hash_without_tx),
            Some(b.clone())
        );
        assert_eq!(store.read_all_closed_blocks(), vec![b.clone()]);

        store.delete_closed_block(&b.hash);
        assert!(store.read_closed_block(&b.hash).is_none());
        assert!(store.read_closed_block_without_tx(&b.hash_without_tx).is_none());
    }

    #[test]
    fn closed_tx_roundtrip() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut store = open_store(&tmp);

        let tx = Transaction::Funds(FundsTx::new(
            5,
            1,
            0,
            AccountId(dummy_hash(1)),
            AccountId(dummy_hash(2)),
        ));
        store.write_closed_tx(tx.clone());
        assert_eq!(store.read_closed_tx(&tx.hash()), Some(tx.clone()));

        store.delete_closed_tx(&tx.hash());
        assert!(store.read_closed_tx(&tx.hash()).is_none());
    }

    #[test]
    fn last_closed_block_persists_across_reopen() {
        let tmp = TempDir::new().expect("create temp dir");
        let b = dummy_block(7);
        {
            let mut store = open_store(&tmp);
            store.write_last_closed_block(b.clone());
        }
        let store = open_store(&tmp);
        assert_eq!(store.read_last_closed_block(), Some(b));
    }
}
