//! High-level consensus engine orchestration.
//!
//! The engine owns everything a validation cycle touches: the typed
//! chain store, the revertible parameter registry, the difficulty
//! history, the slashing dictionary, the per-block undo log and the
//! current head. Callers serialize access through one exclusive lock
//! (the block-validation latch); nothing here re-acquires it.

use std::collections::{BTreeMap, HashMap};

use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::bus::NetHandle;
use crate::config::ConsensusConfig;
use crate::storage::ChainStore;
use crate::types::{Account, AccountId, Address, Block, Hash256, Sig};

use super::apply::BlockUndo;
use super::error::ChainError;
use super::params::{ParameterRegistry, Parameters};
use super::retarget::DifficultyRetargeter;
use super::slashing::SlashingProof;

/// Key material a validating node runs with.
///
/// The wallet keys identify accounts; the commitment keys sign PoS
/// proofs. A bootstrap deployment commonly runs with the validator and
/// root identities collapsed into one.
pub struct ValidatorKeys {
    pub validator: SigningKey,
    pub multisig: SigningKey,
    pub root: SigningKey,
    pub commitment: SigningKey,
    pub root_commitment: SigningKey,
    /// Staking-seed preimage revealed in produced blocks.
    pub seed: Hash256,
}

impl ValidatorKeys {
    /// Generates a fully independent key set.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        ValidatorKeys {
            validator: SigningKey::generate(&mut OsRng),
            multisig: SigningKey::generate(&mut OsRng),
            root: SigningKey::generate(&mut OsRng),
            commitment: SigningKey::generate(&mut OsRng),
            root_commitment: SigningKey::generate(&mut OsRng),
            seed: Hash256(seed),
        }
    }

    /// Key set for a single-validator deployment: the root account is
    /// the validator, so the node can produce on its own chain from
    /// genesis onward.
    pub fn single_validator() -> Self {
        let mut keys = Self::generate();
        keys.root = keys.validator.clone();
        keys.root_commitment = keys.commitment.clone();
        keys
    }

    /// SHA-256 of the staking seed, as registered in state.
    pub fn hashed_seed(&self) -> Hash256 {
        Hash256::compute(self.seed.as_bytes())
    }

    pub fn validator_address(&self) -> Address {
        Address::from_verifying_key(&self.validator.verifying_key())
    }

    pub fn validator_id(&self) -> AccountId {
        self.validator_address().hash()
    }

    pub fn root_address(&self) -> Address {
        Address::from_verifying_key(&self.root.verifying_key())
    }

    pub fn root_id(&self) -> AccountId {
        self.root_address().hash()
    }
}

/// The consensus and chain-management engine.
///
/// Generic over the storage backend `S`.
pub struct ChainEngine<S> {
    pub(crate) cfg: ConsensusConfig,
    pub(crate) params: ParameterRegistry,
    pub(crate) retarget: DifficultyRetargeter,
    pub(crate) slashing: BTreeMap<AccountId, SlashingProof>,
    /// Per-block undo records for the non-self-inverse sub-steps.
    pub(crate) undo_log: HashMap<Hash256, BlockUndo>,
    pub(crate) store: S,
    pub(crate) last_block: Block,
    pub(crate) keys: ValidatorKeys,
    pub(crate) net: NetHandle,
    pub(crate) halted: bool,
}

impl<S: ChainStore> ChainEngine<S> {
    /// Installs the keys, loads the default parameters, seeds the root
    /// account, establishes the genesis block and replays the bootstrap
    /// mempool.
    pub fn init(
        cfg: ConsensusConfig,
        mut store: S,
        keys: ValidatorKeys,
        net: NetHandle,
    ) -> Result<Self, ChainError> {
        let genesis_params = Parameters::from_config(&cfg);
        let params = ParameterRegistry::new(genesis_params);
        let mut retarget = DifficultyRetargeter::new(cfg.initial_difficulty);

        // At least one root key must exist to authorize account creation.
        let mut root = Account::new(Address::from_verifying_key(&keys.root.verifying_key()));
        root.balance = params.active().staking_minimum;
        root.is_staking = true;
        root.commitment_key = *keys.root_commitment.verifying_key().as_bytes();
        root.hashed_seed = keys.hashed_seed();
        root.is_root = true;
        store.put_account(root.clone());
        store.put_root_account(root);

        let genesis = Block::genesis();
        retarget.collect_statistics(
            &genesis,
            params.active().diff_interval,
            params.active().block_interval,
        );
        store.write_closed_block(genesis.clone());
        store.write_last_closed_block(genesis.clone());

        // The bootstrap mempool holds transactions that are already part
        // of the synced chain state; close them without validation.
        for tx in store.read_all_bootstrap_received_transactions() {
            store.delete_open_tx(&tx.hash());
            store.write_closed_tx(tx);
        }
        store.delete_bootstrap_received_mempool();

        tracing::info!(
            fee_minimum = params.active().fee_minimum,
            block_interval = params.active().block_interval,
            diff_interval = params.active().diff_interval,
            initial_difficulty = cfg.initial_difficulty,
            "chain engine initialized"
        );

        Ok(ChainEngine {
            cfg,
            params,
            retarget,
            slashing: BTreeMap::new(),
            undo_log: HashMap::new(),
            store,
            last_block: genesis,
            keys,
            net,
            halted: false,
        })
    }

    /// The head of the longest chain known locally.
    pub fn last_block(&self) -> &Block {
        &self.last_block
    }

    /// The currently active consensus parameters.
    pub fn active_params(&self) -> &Parameters {
        self.params.active()
    }

    /// The difficulty the next block is expected to carry.
    pub fn current_difficulty(&self) -> u8 {
        self.retarget.current_difficulty()
    }

    /// Recorded equivocation proofs, keyed by the offending validator.
    pub fn slashing_dict(&self) -> &BTreeMap<AccountId, SlashingProof> {
        &self.slashing
    }

    /// Whether a critical invariant failure has stopped this engine.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Returns a reference to the underlying chain store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a mutable reference to the underlying chain store.
    ///
    /// This is mainly useful for tests and tooling; consensus logic
    /// normally goes through [`validate`](Self::validate).
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Outbound bus handle.
    pub fn net(&self) -> &NetHandle {
        &self.net
    }

    pub(crate) fn ensure_not_halted(&self) -> Result<(), ChainError> {
        if self.halted {
            return Err(ChainError::Critical(
                "engine halted after invariant failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Marks the engine halted when `e` is critical, then passes it on.
    pub(crate) fn surface(&mut self, e: ChainError) -> ChainError {
        if e.is_critical() {
            self.halted = true;
            tracing::error!(error = %e, "halting: chain state is inconsistent");
        }
        e
    }

    /// Commitment proofs of the last `n` blocks ending at `parent`,
    /// newest first. The genesis block carries no proof and terminates
    /// the walk.
    pub(crate) fn prev_commitment_proofs(&self, parent: &Block, n: usize) -> Vec<Sig> {
        let mut proofs = Vec::with_capacity(n);
        let mut cur = parent.clone();
        while proofs.len() < n && !cur.is_genesis() {
            proofs.push(cur.commitment_proof.clone());
            match self.store.read_closed_block(&cur.prev_hash) {
                Some(prev) => cur = prev,
                None => break,
            }
        }
        proofs
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::bus;
    use crate::consensus::params::PARAM_BLOCK_REWARD;
    use crate::consensus::testutil::TestChain;
    use crate::storage::{ChainStore, InMemoryChainStore};
    use crate::types::{ConfigTx, FundsTx, Transaction};

    #[test]
    fn init_establishes_genesis_and_the_root_account() {
        let chain = TestChain::new();
        assert!(chain.engine.last_block().is_genesis());

        let root = chain
            .engine
            .store()
            .account(&chain.engine.keys.root_id())
            .expect("root account seeded");
        assert!(root.is_root);
        assert!(root.is_staking);
        assert_eq!(root.hashed_seed, chain.engine.keys.hashed_seed());

        let last_closed = chain
            .engine
            .store()
            .read_last_closed_block()
            .expect("genesis is last closed");
        assert!(last_closed.is_genesis());
    }

    #[test]
    fn bootstrap_mempool_replays_into_closed_storage() {
        let (net, _inbox, _transport) = bus::channels();
        let mut store = InMemoryChainStore::new();
        let tx = Transaction::Funds(FundsTx::new(
            1,
            1,
            0,
            AccountId::default(),
            AccountId::default(),
        ));
        store.write_open_tx(tx.clone());
        store.write_bootstrap_received_tx(tx.clone());

        let engine = ChainEngine::init(
            TestChain::config(),
            store,
            ValidatorKeys::single_validator(),
            net,
        )
        .expect("engine init");

        assert!(engine.store().read_closed_tx(&tx.hash()).is_some());
        assert!(engine.store().read_open_tx(&tx.hash()).is_none());
        assert!(
            engine
                .store()
                .read_all_bootstrap_received_transactions()
                .is_empty()
        );
    }

    #[test]
    fn simple_extension_settles_a_transfer() {
        // S1: one transfer of 100 with fee 1 settles into the chain.
        let mut chain = TestChain::new();
        let miner_id = chain.engine.keys.validator_id();
        let miner_before = chain.engine.store().account(&miner_id).unwrap().balance;

        let tx = chain.funds_tx(100, 1, 0);
        chain.engine.store_mut().write_open_tx(tx.clone());
        let b1 = chain.mine();

        assert!(chain.engine.store().read_closed_block(&b1.hash).is_some());
        let acc_a = chain.engine.store().account(&chain.id_a).unwrap();
        assert_eq!(acc_a.balance, 899);
        assert_eq!(acc_a.tx_cnt, 1);
        assert_eq!(
            chain.engine.store().account(&chain.id_b).unwrap().balance,
            100
        );

        let reward = chain.engine.active_params().block_reward;
        assert_eq!(
            chain.engine.store().account(&miner_id).unwrap().balance,
            miner_before + reward + 1
        );

        // The referenced transaction settled from open to closed.
        assert!(chain.engine.store().read_closed_tx(&tx.hash()).is_some());
        assert!(chain.engine.store().read_open_tx(&tx.hash()).is_none());
    }

    #[test]
    fn reorg_rolls_back_the_losing_branch_and_replays_the_winner() {
        // S2: a strictly longer empty chain undoes the settled transfer.
        let mut chain = TestChain::new();
        let tx = chain.funds_tx(100, 1, 0);
        chain.engine.store_mut().write_open_tx(tx.clone());
        let b1 = chain.mine();
        assert_eq!(chain.engine.store().account(&chain.id_a).unwrap().balance, 899);

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 1);
        let b2_prime = chain.build_empty_on(&b1_prime, 2);
        chain
            .transport
            .block_res
            .send(b1_prime.encode())
            .expect("queue ancestor");

        chain.engine.validate(b2_prime.clone(), true).expect("reorg");

        let acc_a = chain.engine.store().account(&chain.id_a).unwrap();
        assert_eq!(acc_a.balance, 1_000);
        assert_eq!(acc_a.tx_cnt, 0);
        assert_eq!(chain.engine.store().account(&chain.id_b).unwrap().balance, 0);

        // The transfer reopened, the losing block moved to the stash.
        assert!(chain.engine.store().read_open_tx(&tx.hash()).is_some());
        assert!(chain.engine.store().read_closed_block(&b1.hash).is_none());
        assert!(
            chain
                .engine
                .store()
                .read_received_block_stash()
                .iter()
                .any(|s| s.hash == b1.hash)
        );
        assert_eq!(chain.engine.last_block().hash, b2_prime.hash);
        assert_eq!(
            chain.engine.store().read_last_closed_block().unwrap().hash,
            b2_prime.hash
        );
    }

    #[test]
    fn equivocation_within_the_window_is_recorded() {
        // S4: the validator fronts two competing height-1 blocks.
        let mut chain = TestChain::new();
        let b1 = chain.mine();

        let genesis = Block::genesis();
        let b1_double = chain.build_empty_on(&genesis, 9);
        // Equal length, so the block itself is rejected...
        assert!(chain.engine.validate(b1_double.clone(), true).is_err());

        // ...but the proof is on file.
        let validator = chain.engine.keys.validator_id();
        let proof = chain
            .engine
            .slashing_dict()
            .get(&validator)
            .expect("equivocation proof recorded");
        assert_eq!(proof.conflicting_block_hash1, b1_double.hash);
        assert!(
            proof.conflicting_block_hash2 == b1.hash
                || proof.conflicting_block_hash2 == b1_double.hash
        );
        assert_eq!(chain.engine.last_block().hash, b1.hash);
    }

    #[test]
    fn validate_then_rollback_restores_state_bit_exactly() {
        // P1/P3: account state, target history, parameter stack and the
        // mempool all return to their prior values.
        let mut chain = TestChain::new();
        let tx = chain.funds_tx(50, 1, 0);
        chain.engine.store_mut().write_open_tx(tx.clone());
        let mut cfg_tx = Transaction::Config(ConfigTx::new(PARAM_BLOCK_REWARD, 9, 1, 0));
        cfg_tx.sign(&chain.engine.keys.root);
        chain.engine.store_mut().write_open_tx(cfg_tx.clone());

        let state_before = chain.engine.store().state_snapshot();
        let retarget_before = chain.engine.retarget.clone();
        let params_depth_before = chain.engine.params.depth();
        let mempool_before: HashSet<_> = chain
            .engine
            .store()
            .read_mempool()
            .iter()
            .map(|t| t.hash())
            .collect();

        let b1 = chain.mine();
        assert_eq!(chain.engine.active_params().block_reward, 9);
        assert_ne!(chain.engine.store().state_snapshot(), state_before);

        chain.engine.rollback(&b1).expect("rollback");

        assert_eq!(chain.engine.store().state_snapshot(), state_before);
        assert_eq!(chain.engine.retarget, retarget_before);
        assert_eq!(chain.engine.params.depth(), params_depth_before);
        assert_eq!(chain.engine.active_params().block_reward, 5);

        let mempool_after: HashSet<_> = chain
            .engine
            .store()
            .read_mempool()
            .iter()
            .map(|t| t.hash())
            .collect();
        assert_eq!(mempool_after, mempool_before);
        assert!(chain.engine.store().read_closed_tx(&tx.hash()).is_none());
        assert!(chain.engine.last_block().is_genesis());
    }

    #[test]
    fn aggregated_transfers_settle_and_reorg_atomically() {
        let mut chain = TestChain::new();
        let t1 = chain.funds_tx(10, 1, 0);
        let t2 = chain.funds_tx(20, 1, 1);
        chain.engine.store_mut().write_open_tx(t1.clone());
        chain.engine.store_mut().write_open_tx(t2.clone());

        let b1 = chain.mine();
        assert_eq!(b1.agg_tx_data.len(), 1);
        let agg_hash = b1.agg_tx_data[0];

        let acc_a = chain.engine.store().account(&chain.id_a).unwrap();
        assert_eq!(acc_a.balance, 1_000 - 10 - 1 - 20 - 1);
        assert_eq!(acc_a.tx_cnt, 2);
        // Container and cargo are closed together.
        assert!(chain.engine.store().read_closed_tx(&agg_hash).is_some());
        assert!(chain.engine.store().read_closed_tx(&t1.hash()).is_some());

        chain.engine.rollback(&b1).expect("rollback");

        let acc_a = chain.engine.store().account(&chain.id_a).unwrap();
        assert_eq!(acc_a.balance, 1_000);
        assert_eq!(acc_a.tx_cnt, 0);
        // Cargo reopens; the container is destroyed outright.
        assert!(chain.engine.store().read_open_tx(&t1.hash()).is_some());
        assert!(chain.engine.store().read_open_tx(&t2.hash()).is_some());
        assert!(chain.engine.store().read_closed_tx(&agg_hash).is_none());
        assert!(chain.engine.store().read_open_tx(&agg_hash).is_none());
    }

    #[test]
    fn missing_closed_tx_during_rollback_halts_the_engine() {
        let mut chain = TestChain::new();
        let tx = chain.funds_tx(100, 1, 0);
        chain.engine.store_mut().write_open_tx(tx.clone());
        let b1 = chain.mine();

        // Corrupt the store behind the engine's back.
        chain.engine.store_mut().delete_closed_tx(&tx.hash());

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 1);
        let b2_prime = chain.build_empty_on(&b1_prime, 2);
        chain
            .transport
            .block_res
            .send(b1_prime.encode())
            .expect("queue ancestor");

        let err = chain.engine.validate(b2_prime, true).unwrap_err();
        assert!(err.is_critical());
        assert!(chain.engine.is_halted());

        // The engine refuses further work.
        let b2 = chain.build_empty_on(&b1, 3);
        assert!(chain.engine.validate(b2, true).unwrap_err().is_critical());
    }

    #[test]
    fn prev_commitment_proofs_walk_back_from_the_parent() {
        let mut chain = TestChain::new();
        let b1 = chain.mine();
        let b2 = chain.mine();

        let proofs = chain.engine.prev_commitment_proofs(&b2, 5);
        assert_eq!(proofs.len(), 2);
        assert_eq!(proofs[0], b2.commitment_proof);
        assert_eq!(proofs[1], b1.commitment_proof);

        let capped = chain.engine.prev_commitment_proofs(&b2, 1);
        assert_eq!(capped.len(), 1);
    }
}
