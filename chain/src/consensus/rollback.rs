//! Mirror of block application, restoring bit-exact prior state.
//!
//! Rollback gathers every referenced transaction from closed storage (a
//! miss there means local corruption and halts the node), reverses the
//! state sub-steps in the exact mirror order of application, and then
//! reverses post-validation: transactions reopen, aggregate containers
//! are destroyed with their cargo reopened, the block moves from closed
//! storage into the received stash, and the head steps back to the
//! parent.

use crate::storage::ChainStore;
use crate::types::{Block, Hash256, Transaction, TxKind};

use super::apply::{
    BlockUndo, acc_state_rollback, aggregated_state_rollback, collect_block_reward_rollback,
    collect_slash_reward_rollback, collect_tx_fees_rollback, funds_state_rollback,
    stake_state_rollback, total_collectible_fees,
};
use super::engine::ChainEngine;
use super::error::ChainError;
use super::validate::BlockData;

impl<S: ChainStore> ChainEngine<S> {
    /// Rolls one block off the head of the chain.
    ///
    /// Callers walk from the head toward the fork ancestor, so `b` is
    /// always the currently last applied block.
    pub(crate) fn rollback(&mut self, b: &Block) -> Result<(), ChainError> {
        let data = self.gather_closed(b)?;

        let undo = match self.undo_log.remove(&b.hash) {
            Some(u) => u,
            // A restart loses the in-memory undo log; blocks without
            // stake changes have nothing to restore from it.
            None if data.stake.is_empty() => BlockUndo::default(),
            None => {
                return Err(ChainError::Critical(
                    "stake undo records missing for rolled-back block".to_string(),
                ));
            }
        };

        // Reverse state-validation, mirror order of application.
        let params = self.params.active().clone();
        if let Some(slash_undo) = &undo.slash {
            collect_slash_reward_rollback(
                &mut self.store,
                &mut self.slashing,
                params.slash_reward,
                &b.beneficiary,
                slash_undo,
            )?;
        }
        let fees = total_collectible_fees(&data.acc, &data.funds, &data.config, &data.stake)?;
        collect_tx_fees_rollback(&mut self.store, fees, &b.beneficiary)?;
        collect_block_reward_rollback(&mut self.store, params.block_reward, &b.beneficiary)?;
        acc_state_rollback(&mut self.store, &data.acc)?;
        aggregated_state_rollback(&mut self.store, &data.agg)?;
        funds_state_rollback(&mut self.store, &data.funds)?;
        stake_state_rollback(&mut self.store, &data.stake, &undo.stake)?;
        self.params.revert(&data.config, b.hash)?;

        // Reverse post-validation: closed transactions reopen. The
        // aggregate containers are destroyed instead; the next miner
        // recreates them from the reopened cargo if it wants to.
        for tx in data.acc.iter().cloned().map(Transaction::Acc) {
            self.reopen_tx(tx);
        }
        for tx in data.funds.iter().cloned().map(Transaction::Funds) {
            self.reopen_tx(tx);
        }
        for tx in data.config.iter().cloned().map(Transaction::Config) {
            self.reopen_tx(tx);
        }
        for tx in data.stake.iter().cloned().map(Transaction::Stake) {
            self.reopen_tx(tx);
        }
        for tx in data.iot.iter().cloned().map(Transaction::Iot) {
            self.reopen_tx(tx);
        }
        for (agg, children) in &data.agg {
            for child in children.iter().cloned().map(Transaction::Funds) {
                self.reopen_tx(child);
            }
            self.store.delete_closed_tx(&agg.hash());
        }

        // The losing chain is unlikely to revive, but a deep reorg must
        // still be able to fetch this block locally.
        self.store.delete_closed_block(&b.hash);
        self.store.write_to_received_stash(b.clone());

        // Counters step back under the pre-block parameter view.
        let params = self.params.active().clone();
        self.retarget.collect_statistics_rollback(params.diff_interval);

        let prev = self
            .store
            .read_closed_block(&b.prev_hash)
            .ok_or_else(|| {
                ChainError::Critical("parent of rolled-back block not in closed storage".to_string())
            })?;
        self.last_block = prev.clone();
        self.store.delete_all_last_closed_block();
        self.store.write_last_closed_block(prev);

        tracing::info!(
            height = b.height,
            hash = %b.hash.short_hex(),
            "block rolled back"
        );
        Ok(())
    }

    fn reopen_tx(&mut self, tx: Transaction) {
        let hash = tx.hash();
        self.store.delete_closed_tx(&hash);
        self.store.write_open_tx(tx);
    }

    /// Reads every transaction a closed block references back out of
    /// closed storage. Any miss is a critical failure: validated
    /// transactions must be in the confirmed store.
    fn gather_closed(&self, b: &Block) -> Result<BlockData, ChainError> {
        fn missing(hash: &Hash256) -> ChainError {
            ChainError::Critical(format!(
                "validated transaction {} was not in the confirmed tx storage",
                hash.short_hex()
            ))
        }

        let mut data = BlockData {
            acc: Vec::new(),
            funds: Vec::new(),
            config: Vec::new(),
            stake: Vec::new(),
            agg: Vec::new(),
            iot: Vec::new(),
            block: b.clone(),
        };

        for kind in TxKind::ALL {
            for hash in b.tx_data(kind) {
                let tx = self.store.read_closed_tx(hash).ok_or_else(|| missing(hash))?;
                match tx {
                    Transaction::Acc(t) => data.acc.push(t),
                    Transaction::Funds(t) => data.funds.push(t),
                    Transaction::Config(t) => data.config.push(t),
                    Transaction::Stake(t) => data.stake.push(t),
                    Transaction::Iot(t) => data.iot.push(t),
                    Transaction::Agg(container) => {
                        let mut children = Vec::with_capacity(container.aggregated.len());
                        for child_hash in &container.aggregated {
                            match self.store.read_closed_tx(child_hash) {
                                Some(Transaction::Funds(t)) => children.push(t),
                                _ => return Err(missing(child_hash)),
                            }
                        }
                        data.agg.push((container, children));
                    }
                }
            }
        }
        Ok(data)
    }
}
