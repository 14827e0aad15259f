//! The validation pipeline.
//!
//! [`ChainEngine::validate`] is the single entry point for every block,
//! locally mined or received. Extensions of the head apply directly;
//! anything else goes through the longest-chain resolver, a rollback
//! phase and a replay phase. Each applied block runs three stages:
//!
//! 1. **pre-validate**: header sanity, PoS draw, commitment proof, and
//!    resolution of every referenced transaction (fetching missing ones
//!    from the network with a hard timeout);
//! 2. **state-validate**: the ordered world-state sub-steps, unwound
//!    completely if any of them fails;
//! 3. **post-validate**: transactions move from open to closed, the
//!    block is persisted, the head and difficulty statistics advance,
//!    and the slashing detector runs.

use crate::storage::ChainStore;
use crate::types::{
    AccTx, AggTx, Block, ConfigTx, FundsTx, Hash256, IotTx, StakeTx, Transaction, TxKind,
    block::merkle_root, current_unix_timestamp,
};

use super::apply::{
    BlockUndo, acc_state_change, acc_state_rollback, aggregated_state_change,
    aggregated_state_rollback, collect_block_reward, collect_block_reward_rollback,
    collect_slash_reward, collect_tx_fees, collect_tx_fees_rollback, funds_state_change,
    funds_state_rollback, stake_state_change, stake_state_rollback, total_collectible_fees,
};
use super::engine::ChainEngine;
use super::error::{ChainError, ValidationError};
use super::finalize::{pos_hash, satisfies_target, verify_commitment_proof};
use super::slashing::seek_slashing_proof;

/// A block together with its resolved transaction objects.
pub struct BlockData {
    pub acc: Vec<AccTx>,
    pub funds: Vec<FundsTx>,
    pub config: Vec<ConfigTx>,
    pub stake: Vec<StakeTx>,
    pub agg: Vec<(AggTx, Vec<FundsTx>)>,
    pub iot: Vec<IotTx>,
    pub block: Block,
}

impl<S: ChainStore> ChainEngine<S> {
    /// Validates a block against the local chain, reorganizing onto the
    /// incoming chain when it is strictly longer.
    ///
    /// With `rollback_safe` false (initial sync), any block that is not
    /// a direct extension of the head is rejected without attempting a
    /// reorg.
    pub fn validate(&mut self, block: Block, rollback_safe: bool) -> Result<(), ChainError> {
        self.ensure_not_halted()?;

        // The equivocation scan sees every incoming block, including
        // ones the resolver goes on to reject.
        let window = self.params.active().slashing_window_size;
        if let Err(e) = seek_slashing_proof(&self.store, &mut self.slashing, &block, window) {
            match e {
                ChainError::Critical(_) => return Err(self.surface(e)),
                _ => tracing::debug!(error = %e, "slashing scan inconclusive"),
            }
        }

        if block.prev_hash == self.last_block.hash {
            return self.apply_block(&block).map_err(|e| self.surface(e));
        }

        if !rollback_safe {
            return Err(ValidationError::Invalid(
                "non-extension block rejected while syncing",
            )
            .into());
        }

        let (to_rollback, to_apply) = match self.block_sequences(&block) {
            Ok(seq) => seq,
            Err(e) => return Err(self.surface(e)),
        };

        tracing::info!(
            rollback = to_rollback.len(),
            apply = to_apply.len(),
            incoming = %block.hash.short_hex(),
            "adopting longer chain"
        );

        for b in &to_rollback {
            if let Err(e) = self.rollback(b) {
                return Err(self.surface(e));
            }
        }
        for b in &to_apply {
            if let Err(e) = self.apply_block(b) {
                // Blocks already replayed stay applied; the failing
                // block and its descendants are abandoned.
                tracing::warn!(
                    height = b.height,
                    hash = %b.hash.short_hex(),
                    error = %e,
                    "replay stopped"
                );
                return Err(self.surface(e));
            }
        }
        Ok(())
    }

    /// Runs the three validation stages against the current head.
    pub(crate) fn apply_block(&mut self, b: &Block) -> Result<(), ChainError> {
        let data = self.pre_validate(b)?;
        let undo = self.state_validate(&data)?;
        self.post_validate(data, undo)
    }

    // --- stage 1 ---

    pub(crate) fn pre_validate(&mut self, b: &Block) -> Result<BlockData, ChainError> {
        let params = self.params.active().clone();

        if b.prev_hash != self.last_block.hash
            || b.prev_hash_without_tx != self.last_block.hash_without_tx
        {
            return Err(ValidationError::Invalid("parent link does not match head").into());
        }
        if b.height != self.last_block.height + 1 {
            return Err(ValidationError::Custom(format!(
                "height {} does not follow head height {}",
                b.height, self.last_block.height
            ))
            .into());
        }
        if b.compute_hash() != b.hash || b.compute_hash_without_tx() != b.hash_without_tx {
            return Err(ValidationError::Invalid("sealed hashes do not match contents").into());
        }

        let now = current_unix_timestamp();
        if b.timestamp > now + params.accepted_time_diff as i64 {
            return Err(ValidationError::Custom(format!(
                "timestamp {} further than {}s in the future",
                b.timestamp, params.accepted_time_diff
            ))
            .into());
        }

        let expected_difficulty = self.retarget.current_difficulty();
        if b.difficulty != expected_difficulty {
            return Err(ValidationError::Custom(format!(
                "difficulty {} where {} was expected",
                b.difficulty, expected_difficulty
            ))
            .into());
        }

        // Producer eligibility and proof binding.
        let producer = self
            .store
            .account(&b.beneficiary)
            .ok_or(ValidationError::Invalid("beneficiary does not exist"))?;
        if !producer.is_staking {
            return Err(ValidationError::Invalid("beneficiary is not staking").into());
        }
        if producer.staking_block_height + params.waiting_minimum > b.height as u64 {
            return Err(ValidationError::Invalid("beneficiary still in waiting period").into());
        }
        if Hash256::compute(b.seed.as_bytes()) != b.hashed_seed
            || b.hashed_seed != producer.hashed_seed
        {
            return Err(ValidationError::Invalid("staking seed does not match commitment").into());
        }
        if !verify_commitment_proof(&b.commitment_proof, &producer.commitment_key, &b.hashed_seed) {
            return Err(ValidationError::Invalid("commitment proof does not verify").into());
        }

        let prev_proofs =
            self.prev_commitment_proofs(&self.last_block, params.num_included_prev_proofs);
        let draw = pos_hash(&b.hashed_seed, &b.prev_hash, &b.beneficiary, b.timestamp, &prev_proofs);
        if !satisfies_target(&draw, b.difficulty) {
            return Err(ValidationError::Invalid("lottery hash misses the target").into());
        }

        // No hash may be referenced twice, across arrays or cargo.
        let mut seen = std::collections::HashSet::new();
        for h in b.all_tx_hashes() {
            if !seen.insert(h) {
                return Err(ValidationError::Invalid("duplicate transaction reference").into());
            }
        }

        let data = self.gather_block_data(b, &mut seen)?;

        if merkle_root(&b.all_tx_hashes()) != b.merkle_root {
            return Err(ValidationError::Invalid("merkle root does not match").into());
        }

        Ok(data)
    }

    /// Resolves every referenced transaction into typed slices,
    /// verifying signatures eagerly.
    fn gather_block_data(
        &mut self,
        b: &Block,
        seen: &mut std::collections::HashSet<Hash256>,
    ) -> Result<BlockData, ChainError> {
        let mut data = BlockData {
            acc: Vec::new(),
            funds: Vec::new(),
            config: Vec::new(),
            stake: Vec::new(),
            agg: Vec::new(),
            iot: Vec::new(),
            block: b.clone(),
        };

        for hash in &b.acc_tx_data {
            match self.resolve_tx(TxKind::Acc, *hash)? {
                Transaction::Acc(t) => data.acc.push(t),
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            }
        }
        for hash in &b.funds_tx_data {
            match self.resolve_tx(TxKind::Funds, *hash)? {
                Transaction::Funds(t) => data.funds.push(t),
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            }
        }
        for hash in &b.config_tx_data {
            match self.resolve_tx(TxKind::Config, *hash)? {
                Transaction::Config(t) => data.config.push(t),
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            }
        }
        for hash in &b.stake_tx_data {
            match self.resolve_tx(TxKind::Stake, *hash)? {
                Transaction::Stake(t) => data.stake.push(t),
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            }
        }
        for hash in &b.iot_tx_data {
            match self.resolve_tx(TxKind::Iot, *hash)? {
                Transaction::Iot(t) => data.iot.push(t),
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            }
        }
        for hash in &b.agg_tx_data {
            let container = match self.resolve_tx(TxKind::Agg, *hash)? {
                Transaction::Agg(t) => t,
                _ => return Err(ValidationError::Invalid("hash resolved to wrong kind").into()),
            };
            let mut children = Vec::with_capacity(container.aggregated.len());
            for child_hash in &container.aggregated {
                if !seen.insert(*child_hash) {
                    return Err(
                        ValidationError::Invalid("aggregate cargo referenced twice").into()
                    );
                }
                match self.resolve_tx(TxKind::Funds, *child_hash)? {
                    Transaction::Funds(t) => children.push(t),
                    _ => {
                        return Err(
                            ValidationError::Invalid("aggregate cargo of wrong kind").into()
                        );
                    }
                }
            }
            data.agg.push((container, children));
        }

        // Signatures verify eagerly; a bad one rejects the whole block.
        let all: Vec<Transaction> = data.all_transactions();
        for tx in &all {
            self.verify_tx_signature(tx)?;
        }

        Ok(data)
    }

    /// Resolves one referenced hash from the open pool or, failing that,
    /// by a targeted network fetch on the matching typed channel.
    fn resolve_tx(&mut self, kind: TxKind, hash: Hash256) -> Result<Transaction, ChainError> {
        if self.store.read_closed_tx(&hash).is_some() {
            return Err(ValidationError::Invalid("transaction already in closed storage").into());
        }
        if let Some(tx) = self.store.read_open_tx(&hash) {
            if tx.kind() != kind {
                return Err(ValidationError::Invalid("open pool kind mismatch").into());
            }
            return Ok(tx);
        }

        self.net.request_tx(kind, hash);
        let fetched = self
            .net
            .await_tx(kind, self.cfg.tx_fetch_timeout)
            .ok_or_else(|| {
                ChainError::Transport(format!(
                    "fetch of transaction {} timed out",
                    hash.short_hex()
                ))
            })?;
        if fetched.hash() != hash {
            return Err(ValidationError::Invalid(
                "received tx hash did not correspond to the request",
            )
            .into());
        }
        self.store.write_open_tx(fetched.clone());
        Ok(fetched)
    }

    /// Checks a transaction signature against the key material its kind
    /// prescribes.
    fn verify_tx_signature(&self, tx: &Transaction) -> Result<(), ValidationError> {
        let ok = match tx {
            Transaction::Funds(f) => {
                let sender = self
                    .store
                    .account(&f.from)
                    .ok_or(ValidationError::Invalid("funds sender does not exist"))?;
                tx.verify_signature(&sender.pubkey_bytes())
                    || tx.verify_signature(self.keys.multisig.verifying_key().as_bytes())
            }
            Transaction::Acc(_) | Transaction::Config(_) => self.signed_by_any_root(tx),
            Transaction::Stake(t) => {
                let acc = self
                    .store
                    .account(&t.account)
                    .ok_or(ValidationError::Invalid("staker does not exist"))?;
                tx.verify_signature(&acc.pubkey_bytes())
            }
            Transaction::Iot(t) => {
                let sender = self
                    .store
                    .account(&t.from)
                    .ok_or(ValidationError::Invalid("iot sender does not exist"))?;
                tx.verify_signature(&sender.pubkey_bytes())
            }
            Transaction::Agg(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::Invalid("signature does not verify"))
        }
    }

    fn signed_by_any_root(&self, tx: &Transaction) -> bool {
        self.store.root_account_ids().into_iter().any(|id| {
            self.store
                .root_account(&id)
                .is_some_and(|root| tx.verify_signature(&root.pubkey_bytes()))
        })
    }

    // --- stage 2 ---

    /// Runs the ordered state sub-steps. On any failure the sub-steps
    /// already committed for this block are reversed before returning.
    pub(crate) fn state_validate(&mut self, data: &BlockData) -> Result<BlockUndo, ChainError> {
        let block_hash = data.block.hash;
        let beneficiary = data.block.beneficiary;

        // Pure computation; do it before any mutation.
        let fees = total_collectible_fees(&data.acc, &data.funds, &data.config, &data.stake)?;

        self.params.install(&data.config, block_hash);
        // This block's own reward and fees run under the parameters it
        // installs.
        let params = self.params.active().clone();

        let mut undo = BlockUndo::default();

        undo.stake = match stake_state_change(
            &mut self.store,
            &data.stake,
            data.block.height,
            params.staking_minimum,
        ) {
            Ok(u) => u,
            Err(e) => {
                self.params.revert(&data.config, block_hash)?;
                return Err(e);
            }
        };

        if let Err(e) = funds_state_change(&mut self.store, &data.funds) {
            stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
            self.params.revert(&data.config, block_hash)?;
            return Err(e);
        }

        if let Err(e) = aggregated_state_change(&mut self.store, &data.agg) {
            funds_state_rollback(&mut self.store, &data.funds)?;
            stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
            self.params.revert(&data.config, block_hash)?;
            return Err(e);
        }

        if let Err(e) = acc_state_change(&mut self.store, &data.acc) {
            aggregated_state_rollback(&mut self.store, &data.agg)?;
            funds_state_rollback(&mut self.store, &data.funds)?;
            stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
            self.params.revert(&data.config, block_hash)?;
            return Err(e);
        }

        if let Err(e) = collect_block_reward(&mut self.store, params.block_reward, &beneficiary) {
            acc_state_rollback(&mut self.store, &data.acc)?;
            aggregated_state_rollback(&mut self.store, &data.agg)?;
            funds_state_rollback(&mut self.store, &data.funds)?;
            stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
            self.params.revert(&data.config, block_hash)?;
            return Err(e);
        }

        if let Err(e) = collect_tx_fees(&mut self.store, fees, &beneficiary) {
            collect_block_reward_rollback(&mut self.store, params.block_reward, &beneficiary)?;
            acc_state_rollback(&mut self.store, &data.acc)?;
            aggregated_state_rollback(&mut self.store, &data.agg)?;
            funds_state_rollback(&mut self.store, &data.funds)?;
            stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
            self.params.revert(&data.config, block_hash)?;
            return Err(e);
        }

        undo.slash = match collect_slash_reward(
            &mut self.store,
            &mut self.slashing,
            params.slash_reward,
            &beneficiary,
        ) {
            Ok(s) => s,
            Err(e) => {
                collect_tx_fees_rollback(&mut self.store, fees, &beneficiary)?;
                collect_block_reward_rollback(&mut self.store, params.block_reward, &beneficiary)?;
                acc_state_rollback(&mut self.store, &data.acc)?;
                aggregated_state_rollback(&mut self.store, &data.agg)?;
                funds_state_rollback(&mut self.store, &data.funds)?;
                stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
                self.params.revert(&data.config, block_hash)?;
                return Err(e);
            }
        };

        Ok(undo)
    }

    // --- stage 3 ---

    /// Moves the block's transactions from open to closed, persists the
    /// block, advances the head and the difficulty statistics, and runs
    /// the slashing detector.
    pub(crate) fn post_validate(
        &mut self,
        data: BlockData,
        undo: BlockUndo,
    ) -> Result<(), ChainError> {
        let block = data.block.clone();
        let all = data.all_transactions();
        for tx in &all {
            self.close_tx(tx.clone());
        }

        self.undo_log.insert(block.hash, undo);
        self.store.write_closed_block(block.clone());
        self.store.delete_open_block(&block.hash);

        let params = self.params.active().clone();
        self.retarget
            .collect_statistics(&block, params.diff_interval, params.block_interval);
        self.last_block = block.clone();
        self.store.delete_all_last_closed_block();
        self.store.write_last_closed_block(block.clone());

        if let Err(e) = seek_slashing_proof(
            &self.store,
            &mut self.slashing,
            &block,
            params.slashing_window_size,
        ) {
            tracing::debug!(error = %e, "post-validation slashing scan inconclusive");
        }

        // Light clients follow header-only hashes; peers learn which
        // transactions are settled.
        self.net.broadcast_block_header(block.header_bytes());
        if !all.is_empty() {
            let cfg = bincode::config::standard();
            if let Ok(payload) = bincode::serde::encode_to_vec(&all, cfg) {
                self.net.broadcast_verified_txs(payload);
            }
        }

        tracing::info!(
            height = block.height,
            hash = %block.hash.short_hex(),
            txs = block.tx_count(),
            "block validated"
        );
        Ok(())
    }

    fn close_tx(&mut self, tx: Transaction) {
        let hash = tx.hash();
        self.store.delete_open_tx(&hash);
        self.store.write_closed_tx(tx);
    }

    /// Admits a gossiped transaction into the open pool.
    ///
    /// Signatures are verified eagerly on receipt; transactions that are
    /// already settled or undercut the fee minimum never enter the pool.
    pub fn accept_gossip_tx(&mut self, tx: Transaction) -> Result<Hash256, ChainError> {
        self.ensure_not_halted()?;
        let hash = tx.hash();
        if self.store.read_closed_tx(&hash).is_some() {
            return Err(ValidationError::Invalid("transaction already settled").into());
        }
        if !matches!(tx, Transaction::Iot(_))
            && tx.fee() < self.params.active().fee_minimum
        {
            return Err(ValidationError::Invalid("fee below the minimum").into());
        }
        self.verify_tx_signature(&tx)?;
        self.store.write_open_tx(tx);
        Ok(hash)
    }
}

impl BlockData {
    /// Every resolved transaction, aggregate cargo included.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        let mut out = Vec::new();
        out.extend(self.acc.iter().cloned().map(Transaction::Acc));
        out.extend(self.funds.iter().cloned().map(Transaction::Funds));
        out.extend(self.config.iter().cloned().map(Transaction::Config));
        out.extend(self.stake.iter().cloned().map(Transaction::Stake));
        for (agg, children) in &self.agg {
            out.extend(children.iter().cloned().map(Transaction::Funds));
            out.push(Transaction::Agg(agg.clone()));
        }
        out.extend(self.iot.iter().cloned().map(Transaction::Iot));
        out
    }
}
