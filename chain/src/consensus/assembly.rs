//! Candidate assembly: draining the open pool into a new block.
//!
//! Inclusion order is arrival order (FIFO). Admission re-checks what
//! state validation will enforce later, tracking tentative sender
//! balances and counters so a miner-built candidate always validates
//! against the head it was built on. Rejected transactions stay open.
//!
//! Consecutive funds transfers from one sender fold into an aggregate
//! container; the container is written to the open pool so peers can
//! resolve its hash, and the replaced transfers travel as its cargo.

use std::collections::HashMap;

use crate::storage::ChainStore;
use crate::types::{AccountId, AggTx, Block, Sig, Transaction};

use super::engine::ChainEngine;
use super::error::ChainError;
use super::finalize::PosContext;

/// Minimum run length of same-sender funds transfers worth folding.
const AGGREGATION_THRESHOLD: usize = 2;

impl<S: ChainStore> ChainEngine<S> {
    /// Builds the next candidate on the current head, together with the
    /// snapshot the PoS grind needs.
    ///
    /// Call under the latch, immediately after any head swap, so the
    /// candidate is never built on a stale head or stale transactions.
    pub fn next_candidate(&mut self) -> Result<(Block, PosContext), ChainError> {
        self.ensure_not_halted()?;

        let mut block = Block::new(
            self.last_block.hash,
            self.last_block.hash_without_tx,
            Sig::default(),
            self.last_block.height + 1,
        );
        block.beneficiary = self.keys.validator_id();
        self.prepare_block(&mut block)?;

        let params = self.params.active();
        let ctx = PosContext {
            prev_timestamp: self.last_block.timestamp,
            difficulty: self.retarget.current_difficulty(),
            hashed_seed: self.keys.hashed_seed(),
            seed: self.keys.seed,
            prev_proofs: self
                .prev_commitment_proofs(&self.last_block, params.num_included_prev_proofs),
            accepted_time_diff: params.accepted_time_diff,
        };
        Ok((block, ctx))
    }

    /// Drains the open pool into `b` up to the block-size budget and
    /// serializes the included set into the six per-kind arrays.
    pub fn prepare_block(&mut self, b: &mut Block) -> Result<(), ChainError> {
        let params = self.params.active().clone();

        let mut budget = params.block_size;
        // Tentative sender views so one candidate cannot overspend an
        // account across several of its transactions.
        let mut avail: HashMap<AccountId, u64> = HashMap::new();
        let mut next_cnt: HashMap<AccountId, u64> = HashMap::new();

        let mut funds_run: Vec<crate::types::FundsTx> = Vec::new();

        for tx in self.store.read_mempool() {
            let cost = tx.encode().len() as u64;
            if cost > budget {
                break;
            }
            if !self.admit(&tx, &params, &mut avail, &mut next_cnt) {
                continue;
            }
            budget -= cost;

            match tx {
                Transaction::Funds(f) => funds_run.push(f),
                Transaction::Acc(t) => b.acc_tx_data.push(t.hash()),
                Transaction::Config(t) => b.config_tx_data.push(t.hash()),
                Transaction::Stake(t) => b.stake_tx_data.push(t.hash()),
                Transaction::Iot(t) => b.iot_tx_data.push(t.hash()),
                // Containers are produced below, never drained.
                Transaction::Agg(_) => {}
            }
        }

        self.fold_aggregates(b, funds_run);

        b.difficulty = self.retarget.current_difficulty();
        b.update_merkle_root();

        tracing::debug!(
            height = b.height,
            txs = b.tx_count(),
            "candidate prepared"
        );
        Ok(())
    }

    /// Admission check mirroring what state validation will enforce.
    fn admit(
        &self,
        tx: &Transaction,
        params: &super::params::Parameters,
        avail: &mut HashMap<AccountId, u64>,
        next_cnt: &mut HashMap<AccountId, u64>,
    ) -> bool {
        // IoT devices run on zero-fee budgets; everything else pays.
        if !matches!(tx, Transaction::Iot(_)) && tx.fee() < params.fee_minimum {
            return false;
        }

        match tx {
            Transaction::Funds(f) => {
                let Some(sender) = self.store.account(&f.from) else {
                    return false;
                };
                if self.store.account(&f.to).is_none() {
                    return false;
                }
                let Some(debit) = f.amount.checked_add(f.fee) else {
                    return false;
                };
                let expected = next_cnt.entry(f.from).or_insert(sender.tx_cnt);
                if f.tx_cnt != *expected {
                    return false;
                }
                let balance = avail.entry(f.from).or_insert(sender.balance);
                if *balance < debit {
                    return false;
                }
                *balance -= debit;
                *expected += 1;
                true
            }
            Transaction::Acc(t) => match self.store.account(&t.issuer) {
                Some(issuer) => issuer.is_root && issuer.balance >= t.fee,
                None => false,
            },
            Transaction::Config(_) => true,
            Transaction::Stake(t) => match self.store.account(&t.account) {
                Some(acc) => {
                    acc.balance >= t.fee
                        && acc.is_staking != t.is_staking
                        && (!t.is_staking || acc.balance - t.fee >= params.staking_minimum)
                }
                None => false,
            },
            Transaction::Iot(t) => self.store.account(&t.from).is_some(),
            Transaction::Agg(_) => false,
        }
    }

    /// Folds runs of consecutive same-sender funds transfers into
    /// aggregate containers; singletons go into the funds array as-is.
    fn fold_aggregates(&mut self, b: &mut Block, selected: Vec<crate::types::FundsTx>) {
        let mut run: Vec<crate::types::FundsTx> = Vec::new();

        let mut flush = |run: &mut Vec<crate::types::FundsTx>,
                         b: &mut Block,
                         store: &mut S| {
            if run.len() >= AGGREGATION_THRESHOLD {
                let amount: u64 = run.iter().map(|t| t.amount).sum();
                let from = run[0].from;
                let cargo = run.iter().map(|t| t.hash()).collect();
                let agg = AggTx::new(amount, from, cargo);
                b.agg_tx_data.push(agg.hash());
                store.write_open_tx(Transaction::Agg(agg));
            } else {
                for tx in run.iter() {
                    b.funds_tx_data.push(tx.hash());
                }
            }
            run.clear();
        };

        for tx in selected {
            if run.last().is_some_and(|prev| prev.from != tx.from) {
                flush(&mut run, b, &mut self.store);
            }
            run.push(tx);
        }
        flush(&mut run, b, &mut self.store);
    }
}

/// Returns an empty candidate with parent links set.
///
/// Thin convenience over [`Block::new`] for callers that assemble blocks
/// outside an engine (tests, simulators).
pub fn new_block(
    prev_hash: crate::types::Hash256,
    prev_hash_without_tx: crate::types::Hash256,
    commitment_proof: Sig,
    height: u32,
) -> Block {
    Block::new(prev_hash, prev_hash_without_tx, commitment_proof, height)
}

#[cfg(test)]
mod tests {
    use crate::consensus::testutil::TestChain;
    use crate::types::{IotTx, Transaction};

    #[test]
    fn candidate_includes_open_txs_in_arrival_order() {
        let mut chain = TestChain::new();
        let t1 = chain.funds_tx(10, 1, 0);
        let t2 = chain.funds_tx(20, 1, 1);
        chain.engine.store_mut().write_open_tx(t1.clone());
        chain.engine.store_mut().write_open_tx(t2.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        // Two consecutive same-sender transfers fold into one aggregate.
        assert_eq!(block.agg_tx_data.len(), 1);
        assert!(block.funds_tx_data.is_empty());
    }

    #[test]
    fn single_transfer_is_not_aggregated() {
        let mut chain = TestChain::new();
        let t1 = chain.funds_tx(10, 1, 0);
        chain.engine.store_mut().write_open_tx(t1.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        assert_eq!(block.funds_tx_data, vec![t1.hash()]);
        assert!(block.agg_tx_data.is_empty());
    }

    #[test]
    fn below_minimum_fee_stays_open() {
        let mut chain = TestChain::new();
        let cheap = chain.funds_tx(10, 0, 0);
        chain.engine.store_mut().write_open_tx(cheap.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        assert_eq!(block.tx_count(), 0);
        assert!(chain.engine.store().read_open_tx(&cheap.hash()).is_some());
    }

    #[test]
    fn iot_txs_are_exempt_from_the_fee_minimum() {
        let mut chain = TestChain::new();
        let iot = Transaction::Iot(IotTx::new(0, chain.id_a, chain.id_b, vec![1, 2], 0));
        chain.engine.store_mut().write_open_tx(iot.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        assert_eq!(block.iot_tx_data, vec![iot.hash()]);
    }

    #[test]
    fn overspending_sender_is_cut_off() {
        let mut chain = TestChain::new();
        // Account A holds 1000; the second transfer would overdraw.
        let first = chain.funds_tx(800, 1, 0);
        chain.engine.store_mut().write_open_tx(first);
        let overdraw = chain.funds_tx(800, 1, 1);
        chain.engine.store_mut().write_open_tx(overdraw.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        assert_eq!(block.funds_tx_data.len() + block.agg_tx_data.len(), 1);
        assert!(chain.engine.store().read_open_tx(&overdraw.hash()).is_some());
    }

    #[test]
    fn out_of_order_counter_stays_open() {
        let mut chain = TestChain::new();
        let skipped = chain.funds_tx(10, 1, 5);
        chain.engine.store_mut().write_open_tx(skipped.clone());

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        assert_eq!(block.tx_count(), 0);
    }

    #[test]
    fn aggregate_cargo_is_resolvable_from_the_open_pool() {
        let mut chain = TestChain::new();
        let t1 = chain.funds_tx(10, 1, 0);
        let t2 = chain.funds_tx(20, 1, 1);
        chain.engine.store_mut().write_open_tx(t1);
        chain.engine.store_mut().write_open_tx(t2);

        let (block, _) = chain.engine.next_candidate().expect("candidate");
        let agg_hash = block.agg_tx_data[0];
        match chain.engine.store().read_open_tx(&agg_hash) {
            Some(Transaction::Agg(agg)) => {
                assert_eq!(agg.amount, 30);
                assert_eq!(agg.aggregated.len(), 2);
            }
            other => panic!("aggregate not in open pool: {other:?}"),
        }
    }
}
