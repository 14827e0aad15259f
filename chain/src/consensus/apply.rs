//! Ordered world-state transitions and their exact inverses.
//!
//! Application order within a block is fixed: config changes, stake
//! changes, funds transfers, aggregated-sender rollups, account
//! creations, block reward, fees, slashing collection. Every sub-step
//! either completes for the whole block or reverses the transactions it
//! already touched before reporting the failure; the rollback module
//! runs the same inverses in mirrored order.
//!
//! Stake changes and slash claims are not self-inverse (they overwrite
//! fields whose previous values the transaction does not carry), so they
//! return undo records the engine keeps per block hash.

use std::collections::BTreeMap;

use crate::storage::ChainStore;
use crate::types::{
    AccTx, Account, AccountId, Address, COMM_KEY_LEN, ConfigTx, FundsTx, Hash256, StakeTx,
};

use super::error::{ChainError, ValidationError};
use super::slashing::SlashingProof;

/// Previous staking fields of one account touched by a StakeTx.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeUndo {
    pub account: AccountId,
    pub prev_is_staking: bool,
    pub prev_commitment_key: [u8; COMM_KEY_LEN],
    pub prev_hashed_seed: Hash256,
    pub prev_staking_block_height: u64,
}

/// Record of a slash-reward claim so rollback can re-arm the proof.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlashUndo {
    pub slashed: AccountId,
    pub proof: SlashingProof,
    pub prev_is_staking: bool,
}

/// Undo records of one applied block, keyed by its hash in the engine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub stake: Vec<StakeUndo>,
    pub slash: Option<SlashUndo>,
}

fn critical_account(id: &AccountId) -> ChainError {
    ChainError::Critical(format!(
        "account {} vanished during rollback",
        id.as_hash().short_hex()
    ))
}

fn critical_underflow(what: &str) -> ChainError {
    ChainError::Critical(format!("rollback would drive {what} negative"))
}

// --- funds transfers ---

fn apply_single_funds<S: ChainStore>(store: &mut S, tx: &FundsTx) -> Result<(), ValidationError> {
    let mut sender = store
        .account(&tx.from)
        .ok_or(ValidationError::Invalid("funds sender does not exist"))?;
    if store.account(&tx.to).is_none() {
        return Err(ValidationError::Invalid("funds receiver does not exist"));
    }
    if tx.tx_cnt != sender.tx_cnt {
        return Err(ValidationError::Custom(format!(
            "tx counter {} does not match sender counter {}",
            tx.tx_cnt, sender.tx_cnt
        )));
    }
    let debit = tx
        .amount
        .checked_add(tx.fee)
        .ok_or(ValidationError::Invalid("amount + fee overflows"))?;
    if sender.balance < debit {
        return Err(ValidationError::Custom(format!(
            "sender balance {} below amount {} + fee {}",
            sender.balance, tx.amount, tx.fee
        )));
    }

    sender.balance -= debit;
    sender.tx_cnt += 1;
    store.put_account(sender);

    // Re-read so self-transfers observe the debit.
    let mut receiver = store
        .account(&tx.to)
        .ok_or(ValidationError::Invalid("funds receiver does not exist"))?;
    receiver.balance = receiver
        .balance
        .checked_add(tx.amount)
        .ok_or(ValidationError::Invalid("receiver balance overflows"))?;
    store.put_account(receiver);
    Ok(())
}

fn revert_single_funds<S: ChainStore>(store: &mut S, tx: &FundsTx) -> Result<(), ChainError> {
    let mut receiver = store.account(&tx.to).ok_or_else(|| critical_account(&tx.to))?;
    receiver.balance = receiver
        .balance
        .checked_sub(tx.amount)
        .ok_or_else(|| critical_underflow("receiver balance"))?;
    store.put_account(receiver);

    let mut sender = store
        .account(&tx.from)
        .ok_or_else(|| critical_account(&tx.from))?;
    let refund = tx
        .amount
        .checked_add(tx.fee)
        .ok_or_else(|| ChainError::Critical("refund amount overflows".to_string()))?;
    sender.balance = sender
        .balance
        .checked_add(refund)
        .ok_or_else(|| ChainError::Critical("sender balance overflow on refund".to_string()))?;
    sender.tx_cnt = sender
        .tx_cnt
        .checked_sub(1)
        .ok_or_else(|| critical_underflow("sender tx counter"))?;
    store.put_account(sender);
    Ok(())
}

/// Applies every funds transfer of a block, in array order.
pub fn funds_state_change<S: ChainStore>(
    store: &mut S,
    txs: &[FundsTx],
) -> Result<(), ChainError> {
    for (i, tx) in txs.iter().enumerate() {
        if let Err(e) = apply_single_funds(store, tx) {
            for done in txs[..i].iter().rev() {
                revert_single_funds(store, done)?;
            }
            return Err(e.into());
        }
    }
    Ok(())
}

/// Exact inverse of [`funds_state_change`].
pub fn funds_state_rollback<S: ChainStore>(
    store: &mut S,
    txs: &[FundsTx],
) -> Result<(), ChainError> {
    for tx in txs.iter().rev() {
        revert_single_funds(store, tx)?;
    }
    Ok(())
}

// --- aggregated-sender rollups ---

/// Structural checks on one container against its resolved cargo.
fn check_aggregate(agg: &crate::types::AggTx, children: &[FundsTx]) -> Result<(), ValidationError> {
    if children.is_empty() {
        return Err(ValidationError::Invalid("aggregate with empty cargo"));
    }
    if children.len() != agg.aggregated.len() {
        return Err(ValidationError::Invalid("aggregate cargo incomplete"));
    }
    let mut sum: u64 = 0;
    for child in children {
        if child.from != agg.from {
            return Err(ValidationError::Invalid(
                "aggregate cargo crosses sender boundaries",
            ));
        }
        sum = sum
            .checked_add(child.amount)
            .ok_or(ValidationError::Invalid("aggregate amount overflows"))?;
    }
    if sum != agg.amount {
        return Err(ValidationError::Custom(format!(
            "aggregate amount {} does not match cargo sum {}",
            agg.amount, sum
        )));
    }
    Ok(())
}

/// Applies aggregated funds transfers. The container is atomic: its
/// cargo either applies completely or not at all.
pub fn aggregated_state_change<S: ChainStore>(
    store: &mut S,
    aggs: &[(crate::types::AggTx, Vec<FundsTx>)],
) -> Result<(), ChainError> {
    // No mutation happens before all structural checks pass.
    for (agg, children) in aggs {
        check_aggregate(agg, children).map_err(ChainError::from)?;
    }

    let flattened: Vec<&FundsTx> = aggs.iter().flat_map(|(_, c)| c.iter()).collect();
    for (i, tx) in flattened.iter().enumerate() {
        if let Err(e) = apply_single_funds(store, tx) {
            for done in flattened[..i].iter().rev() {
                revert_single_funds(store, done)?;
            }
            return Err(e.into());
        }
    }
    Ok(())
}

/// Exact inverse of [`aggregated_state_change`].
pub fn aggregated_state_rollback<S: ChainStore>(
    store: &mut S,
    aggs: &[(crate::types::AggTx, Vec<FundsTx>)],
) -> Result<(), ChainError> {
    let flattened: Vec<&FundsTx> = aggs.iter().flat_map(|(_, c)| c.iter()).collect();
    for tx in flattened.iter().rev() {
        revert_single_funds(store, tx)?;
    }
    Ok(())
}

// --- account creation ---

fn apply_single_acc<S: ChainStore>(store: &mut S, tx: &AccTx) -> Result<(), ValidationError> {
    let mut issuer = store
        .account(&tx.issuer)
        .ok_or(ValidationError::Invalid("acc issuer does not exist"))?;
    if !issuer.is_root {
        return Err(ValidationError::Invalid("acc issuer is not a root account"));
    }
    if issuer.balance < tx.fee {
        return Err(ValidationError::Invalid("acc issuer cannot cover the fee"));
    }

    let address = Address::from_pubkey_bytes(&tx.pub_key);
    if store.account(&address.hash()).is_some() {
        return Err(ValidationError::Invalid("account already exists"));
    }

    issuer.balance -= tx.fee;
    store.put_account(issuer);
    store.put_account(Account::new(address));
    Ok(())
}

fn revert_single_acc<S: ChainStore>(store: &mut S, tx: &AccTx) -> Result<(), ChainError> {
    let address = Address::from_pubkey_bytes(&tx.pub_key);
    store.remove_account(&address.hash());

    let mut issuer = store
        .account(&tx.issuer)
        .ok_or_else(|| critical_account(&tx.issuer))?;
    issuer.balance = issuer
        .balance
        .checked_add(tx.fee)
        .ok_or_else(|| ChainError::Critical("issuer balance overflow on refund".to_string()))?;
    store.put_account(issuer);
    Ok(())
}

/// Creates the accounts of a block, debiting each issuing root.
pub fn acc_state_change<S: ChainStore>(store: &mut S, txs: &[AccTx]) -> Result<(), ChainError> {
    for (i, tx) in txs.iter().enumerate() {
        if let Err(e) = apply_single_acc(store, tx) {
            for done in txs[..i].iter().rev() {
                revert_single_acc(store, done)?;
            }
            return Err(e.into());
        }
    }
    Ok(())
}

/// Exact inverse of [`acc_state_change`].
pub fn acc_state_rollback<S: ChainStore>(store: &mut S, txs: &[AccTx]) -> Result<(), ChainError> {
    for tx in txs.iter().rev() {
        revert_single_acc(store, tx)?;
    }
    Ok(())
}

// --- stake changes ---

/// Applies the stake toggles of a block, returning the undo records the
/// inverse needs.
pub fn stake_state_change<S: ChainStore>(
    store: &mut S,
    txs: &[StakeTx],
    block_height: u32,
    staking_minimum: u64,
) -> Result<Vec<StakeUndo>, ChainError> {
    let mut undos: Vec<StakeUndo> = Vec::with_capacity(txs.len());

    for (i, tx) in txs.iter().enumerate() {
        let result = (|| -> Result<StakeUndo, ValidationError> {
            let mut acc = store
                .account(&tx.account)
                .ok_or(ValidationError::Invalid("staker does not exist"))?;
            if acc.balance < tx.fee {
                return Err(ValidationError::Invalid("staker cannot cover the fee"));
            }
            if acc.is_staking == tx.is_staking {
                return Err(ValidationError::Invalid("staking flag already set"));
            }
            if tx.is_staking && acc.balance - tx.fee < staking_minimum {
                return Err(ValidationError::Invalid("balance below staking minimum"));
            }

            let undo = StakeUndo {
                account: tx.account,
                prev_is_staking: acc.is_staking,
                prev_commitment_key: acc.commitment_key,
                prev_hashed_seed: acc.hashed_seed,
                prev_staking_block_height: acc.staking_block_height,
            };

            acc.balance -= tx.fee;
            acc.is_staking = tx.is_staking;
            if tx.is_staking {
                acc.commitment_key = tx.commitment_key;
                acc.hashed_seed = tx.hashed_seed;
                acc.staking_block_height = block_height as u64;
            }
            store.put_account(acc);
            Ok(undo)
        })();

        match result {
            Ok(undo) => undos.push(undo),
            Err(e) => {
                stake_state_rollback(store, &txs[..i], &undos)?;
                return Err(e.into());
            }
        }
    }
    Ok(undos)
}

/// Exact inverse of [`stake_state_change`], restoring the previous
/// staking fields from the undo records.
pub fn stake_state_rollback<S: ChainStore>(
    store: &mut S,
    txs: &[StakeTx],
    undos: &[StakeUndo],
) -> Result<(), ChainError> {
    if txs.len() != undos.len() {
        return Err(ChainError::Critical(
            "stake undo records out of step with block".to_string(),
        ));
    }
    for (tx, undo) in txs.iter().zip(undos.iter()).rev() {
        let mut acc = store
            .account(&tx.account)
            .ok_or_else(|| critical_account(&tx.account))?;
        acc.balance = acc
            .balance
            .checked_add(tx.fee)
            .ok_or_else(|| ChainError::Critical("staker balance overflow on refund".to_string()))?;
        acc.is_staking = undo.prev_is_staking;
        acc.commitment_key = undo.prev_commitment_key;
        acc.hashed_seed = undo.prev_hashed_seed;
        acc.staking_block_height = undo.prev_staking_block_height;
        store.put_account(acc);
    }
    Ok(())
}

// --- block reward and fees ---

/// Credits the block reward to the beneficiary.
pub fn collect_block_reward<S: ChainStore>(
    store: &mut S,
    reward: u64,
    beneficiary: &AccountId,
) -> Result<(), ChainError> {
    let mut acc = store
        .account(beneficiary)
        .ok_or(ValidationError::Invalid("beneficiary does not exist"))?;
    acc.balance = acc
        .balance
        .checked_add(reward)
        .ok_or(ValidationError::Invalid("beneficiary balance overflows"))?;
    store.put_account(acc);
    Ok(())
}

/// Exact inverse of [`collect_block_reward`].
pub fn collect_block_reward_rollback<S: ChainStore>(
    store: &mut S,
    reward: u64,
    beneficiary: &AccountId,
) -> Result<(), ChainError> {
    let mut acc = store
        .account(beneficiary)
        .ok_or_else(|| critical_account(beneficiary))?;
    acc.balance = acc
        .balance
        .checked_sub(reward)
        .ok_or_else(|| critical_underflow("beneficiary balance"))?;
    store.put_account(acc);
    Ok(())
}

/// Sum of the fees a block's beneficiary collects.
///
/// IoT transactions and aggregate containers contribute nothing; their
/// senders already run on zero-fee budgets.
pub fn total_collectible_fees(
    acc_txs: &[AccTx],
    funds_txs: &[FundsTx],
    config_txs: &[ConfigTx],
    stake_txs: &[StakeTx],
) -> Result<u64, ChainError> {
    let mut total: u64 = 0;
    let fees = acc_txs
        .iter()
        .map(|t| t.fee)
        .chain(funds_txs.iter().map(|t| t.fee))
        .chain(config_txs.iter().map(|t| t.fee))
        .chain(stake_txs.iter().map(|t| t.fee));
    for fee in fees {
        total = total
            .checked_add(fee)
            .ok_or(ValidationError::Invalid("fee total overflows"))?;
    }
    Ok(total)
}

/// Credits the collected fees to the beneficiary.
pub fn collect_tx_fees<S: ChainStore>(
    store: &mut S,
    total: u64,
    beneficiary: &AccountId,
) -> Result<(), ChainError> {
    collect_block_reward(store, total, beneficiary)
}

/// Exact inverse of [`collect_tx_fees`].
pub fn collect_tx_fees_rollback<S: ChainStore>(
    store: &mut S,
    total: u64,
    beneficiary: &AccountId,
) -> Result<(), ChainError> {
    collect_block_reward_rollback(store, total, beneficiary)
}

// --- slashing collection ---

/// Lets the block beneficiary claim the oldest pending slashing proof.
///
/// The equivocator loses its staking flag and the claimant collects the
/// slash reward; the consumed proof travels into the undo record so a
/// rollback can re-arm it. Proofs against the beneficiary itself are
/// never self-claimed.
pub fn collect_slash_reward<S: ChainStore>(
    store: &mut S,
    slashing: &mut BTreeMap<AccountId, SlashingProof>,
    reward: u64,
    beneficiary: &AccountId,
) -> Result<Option<SlashUndo>, ChainError> {
    let claimable = slashing
        .iter()
        .find(|(validator, _)| *validator != beneficiary && store.account(validator).is_some())
        .map(|(validator, proof)| (*validator, proof.clone()));

    let Some((validator, proof)) = claimable else {
        return Ok(None);
    };

    let mut slashed = store
        .account(&validator)
        .ok_or_else(|| critical_account(&validator))?;
    let prev_is_staking = slashed.is_staking;
    slashed.is_staking = false;
    store.put_account(slashed);

    if let Err(e) = collect_block_reward(store, reward, beneficiary) {
        // Undo the flag flip before reporting, keeping the sub-step atomic.
        let mut slashed = store
            .account(&validator)
            .ok_or_else(|| critical_account(&validator))?;
        slashed.is_staking = prev_is_staking;
        store.put_account(slashed);
        return Err(e);
    }

    slashing.remove(&validator);
    tracing::info!(
        slashed = %validator.as_hash().short_hex(),
        claimant = %beneficiary.as_hash().short_hex(),
        "slashing proof claimed"
    );
    Ok(Some(SlashUndo {
        slashed: validator,
        proof,
        prev_is_staking,
    }))
}

/// Exact inverse of [`collect_slash_reward`].
pub fn collect_slash_reward_rollback<S: ChainStore>(
    store: &mut S,
    slashing: &mut BTreeMap<AccountId, SlashingProof>,
    reward: u64,
    beneficiary: &AccountId,
    undo: &SlashUndo,
) -> Result<(), ChainError> {
    collect_block_reward_rollback(store, reward, beneficiary)?;

    let mut slashed = store
        .account(&undo.slashed)
        .ok_or_else(|| critical_account(&undo.slashed))?;
    slashed.is_staking = undo.prev_is_staking;
    store.put_account(slashed);

    slashing.insert(undo.slashed, undo.proof.clone());
    Ok(())
}
