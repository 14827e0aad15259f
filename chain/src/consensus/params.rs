//! Revertible registry of consensus parameters.
//!
//! An instance of [`Parameters`] is pushed whenever a block containing
//! at least one ConfigTx is applied; the hash of that block is recorded
//! so the change can be popped again when the block rolls back. The
//! registry records every parameter change, including ids this build has
//! no code for, which keeps nodes of different versions in consensus.

use crate::config::ConsensusConfig;
use crate::types::{ConfigTx, Hash256};

use super::error::ChainError;

/// Parameter ids understood by this build.
pub const PARAM_FEE_MINIMUM: u8 = 1;
pub const PARAM_BLOCK_SIZE: u8 = 2;
pub const PARAM_DIFF_INTERVAL: u8 = 3;
pub const PARAM_BLOCK_INTERVAL: u8 = 4;
pub const PARAM_BLOCK_REWARD: u8 = 5;
pub const PARAM_STAKING_MINIMUM: u8 = 6;
pub const PARAM_WAITING_MINIMUM: u8 = 7;
pub const PARAM_ACCEPTED_TIME_DIFF: u8 = 8;
pub const PARAM_SLASHING_WINDOW_SIZE: u8 = 9;
pub const PARAM_SLASH_REWARD: u8 = 10;
pub const PARAM_NUM_INCLUDED_PREV_PROOFS: u8 = 11;

/// One immutable snapshot of the consensus parameters, tagged with the
/// hash of the block that installed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Parameters {
    /// Hash of the block whose ConfigTxs produced this snapshot; zero
    /// for the genesis defaults.
    pub block_hash: Hash256,
    pub fee_minimum: u64,
    pub block_size: u64,
    pub diff_interval: u64,
    pub block_interval: u64,
    pub block_reward: u64,
    pub staking_minimum: u64,
    pub waiting_minimum: u64,
    pub accepted_time_diff: u64,
    pub slashing_window_size: u64,
    pub slash_reward: u64,
    pub num_included_prev_proofs: usize,
}

impl Parameters {
    /// Genesis defaults from the deployment configuration.
    pub fn from_config(cfg: &ConsensusConfig) -> Self {
        Parameters {
            block_hash: Hash256::zero(),
            fee_minimum: cfg.fee_minimum,
            block_size: cfg.block_size,
            diff_interval: cfg.diff_interval,
            block_interval: cfg.block_interval,
            block_reward: cfg.block_reward,
            staking_minimum: cfg.staking_minimum,
            waiting_minimum: cfg.waiting_minimum,
            accepted_time_diff: cfg.accepted_time_diff,
            slashing_window_size: cfg.slashing_window_size,
            slash_reward: cfg.slash_reward,
            num_included_prev_proofs: cfg.num_included_prev_proofs,
        }
    }

    /// Applies one parameter change in place.
    ///
    /// Unknown ids change nothing; the snapshot is still recorded so the
    /// rollback bookkeeping stays symmetric across node versions.
    fn apply(&mut self, tx: &ConfigTx) {
        match tx.id {
            PARAM_FEE_MINIMUM => self.fee_minimum = tx.payload,
            PARAM_BLOCK_SIZE => self.block_size = tx.payload,
            PARAM_DIFF_INTERVAL => self.diff_interval = tx.payload,
            PARAM_BLOCK_INTERVAL => self.block_interval = tx.payload,
            PARAM_BLOCK_REWARD => self.block_reward = tx.payload,
            PARAM_STAKING_MINIMUM => self.staking_minimum = tx.payload,
            PARAM_WAITING_MINIMUM => self.waiting_minimum = tx.payload,
            PARAM_ACCEPTED_TIME_DIFF => self.accepted_time_diff = tx.payload,
            PARAM_SLASHING_WINDOW_SIZE => self.slashing_window_size = tx.payload,
            PARAM_SLASH_REWARD => self.slash_reward = tx.payload,
            PARAM_NUM_INCLUDED_PREV_PROOFS => {
                self.num_included_prev_proofs = tx.payload as usize
            }
            other => {
                tracing::debug!(id = other, "config change with unknown parameter id");
            }
        }
    }
}

/// Stack of parameter snapshots, genesis defaults at the bottom.
#[derive(Clone, Debug)]
pub struct ParameterRegistry {
    stack: Vec<Parameters>,
}

impl ParameterRegistry {
    pub fn new(genesis: Parameters) -> Self {
        ParameterRegistry {
            stack: vec![genesis],
        }
    }

    /// The currently active parameter set.
    pub fn active(&self) -> &Parameters {
        self.stack.last().expect("registry always holds genesis")
    }

    /// Installs the changes of one block's ConfigTxs.
    ///
    /// No-op when the block carries no config transactions; otherwise a
    /// single snapshot tagged with `block_hash` is pushed, covering all
    /// of them in array order.
    pub fn install(&mut self, txs: &[ConfigTx], block_hash: Hash256) {
        if txs.is_empty() {
            return;
        }
        let mut next = self.active().clone();
        for tx in txs {
            next.apply(tx);
        }
        next.block_hash = block_hash;
        tracing::info!(block = %block_hash.short_hex(), "consensus parameters changed");
        self.stack.push(next);
    }

    /// Reverts the snapshot a block installed, if it installed one.
    pub fn revert(&mut self, txs: &[ConfigTx], block_hash: Hash256) -> Result<(), ChainError> {
        if txs.is_empty() {
            return Ok(());
        }
        if self.stack.len() < 2 {
            return Err(ChainError::Critical(
                "parameter stack underflow during rollback".to_string(),
            ));
        }
        let top = self.stack.last().expect("checked non-empty");
        if top.block_hash != block_hash {
            return Err(ChainError::Critical(format!(
                "parameter stack top {} does not match rolled-back block {}",
                top.block_hash.short_hex(),
                block_hash.short_hex()
            )));
        }
        self.stack.pop();
        Ok(())
    }

    /// Depth of the stack, mostly for diagnostics and tests.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_LEN;

    fn registry() -> ParameterRegistry {
        ParameterRegistry::new(Parameters::from_config(&ConsensusConfig::default()))
    }

    fn block_hash(byte: u8) -> Hash256 {
        Hash256([byte; HASH_LEN])
    }

    #[test]
    fn install_and_revert_restore_previous_set_exactly() {
        let mut reg = registry();
        let before = reg.active().clone();

        let txs = vec![
            ConfigTx::new(PARAM_BLOCK_REWARD, 50, 1, 0),
            ConfigTx::new(PARAM_FEE_MINIMUM, 3, 1, 1),
        ];
        reg.install(&txs, block_hash(1));

        assert_eq!(reg.active().block_reward, 50);
        assert_eq!(reg.active().fee_minimum, 3);
        assert_eq!(reg.depth(), 2);

        reg.revert(&txs, block_hash(1)).expect("revert");
        assert_eq!(reg.active(), &before);
        assert_eq!(reg.depth(), 1);
    }

    #[test]
    fn empty_config_slice_is_a_noop() {
        let mut reg = registry();
        reg.install(&[], block_hash(1));
        assert_eq!(reg.depth(), 1);
        reg.revert(&[], block_hash(1)).expect("noop revert");
        assert_eq!(reg.depth(), 1);
    }

    #[test]
    fn unknown_parameter_id_changes_nothing_but_is_recorded() {
        let mut reg = registry();
        let before = {
            let mut p = reg.active().clone();
            p.block_hash = block_hash(9);
            p
        };

        let txs = vec![ConfigTx::new(200, 7, 1, 0)];
        reg.install(&txs, block_hash(9));

        assert_eq!(reg.depth(), 2);
        assert_eq!(reg.active(), &before);
    }

    #[test]
    fn revert_with_mismatched_block_is_critical() {
        let mut reg = registry();
        let txs = vec![ConfigTx::new(PARAM_BLOCK_REWARD, 50, 1, 0)];
        reg.install(&txs, block_hash(1));

        let err = reg.revert(&txs, block_hash(2)).unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn revert_below_genesis_is_critical() {
        let mut reg = registry();
        let txs = vec![ConfigTx::new(PARAM_BLOCK_REWARD, 50, 1, 0)];
        let err = reg.revert(&txs, block_hash(1)).unwrap_err();
        assert!(err.is_critical());
    }
}
