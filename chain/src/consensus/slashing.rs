//! Equivocation detection.
//!
//! A validator that produces two blocks on competing chains within the
//! slashing window is equivocating. The detector scans the known closed
//! blocks for such a pair and records a [`SlashingProof`] keyed by the
//! validator; a later block's beneficiary can claim the slash reward by
//! publishing the proof.

use std::collections::BTreeMap;

use crate::storage::ChainStore;
use crate::types::{AccountId, Block, Hash256};

use super::error::{ChainError, ValidationError};

/// Evidence that one validator produced two blocks on competing chains.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlashingProof {
    pub conflicting_block_hash1: Hash256,
    pub conflicting_block_hash2: Hash256,
    pub conflicting_block_hash_without_tx1: Hash256,
    pub conflicting_block_hash_without_tx2: Hash256,
}

/// Scans the closed blocks for a conflict between `block` and any block
/// by the same beneficiary within the slashing window, recording a proof
/// into `slashing` if one exists.
///
/// Blocks that extend the local head cannot conflict with it and are
/// skipped outright.
pub fn seek_slashing_proof<S: ChainStore>(
    store: &S,
    slashing: &mut BTreeMap<AccountId, SlashingProof>,
    block: &Block,
    slashing_window_size: u64,
) -> Result<(), ChainError> {
    let last_closed = store
        .read_last_closed_block()
        .ok_or(ValidationError::Invalid("latest closed block not found"))?;

    // Extending our own chain is never an equivocation against it.
    if last_closed.hash == block.hash || last_closed.hash == block.prev_hash {
        return Ok(());
    }

    for prev in store.read_all_closed_blocks() {
        if prev.hash == block.hash || prev.beneficiary != block.beneficiary {
            continue;
        }
        let height_gap = (prev.height as i64 - block.height as i64).unsigned_abs();
        if height_gap >= slashing_window_size {
            continue;
        }
        if is_in_same_chain(store, &prev, block) {
            continue;
        }

        tracing::warn!(
            validator = %block.beneficiary.as_hash().short_hex(),
            first = %prev.hash.short_hex(),
            second = %block.hash.short_hex(),
            "equivocation detected"
        );
        slashing.insert(
            block.beneficiary,
            SlashingProof {
                conflicting_block_hash1: block.hash,
                conflicting_block_hash2: prev.hash,
                conflicting_block_hash_without_tx1: block.hash_without_tx,
                conflicting_block_hash_without_tx2: prev.hash_without_tx,
            },
        );
    }
    Ok(())
}

/// Checks whether two blocks lie on the same chain.
///
/// Walks parents of the higher block by full hash, falling back to the
/// header-only hash when the full hash is not resident. Both lookups are
/// read before either result is used. When neither chain is fully
/// resident locally the walk answers "not same chain" conservatively,
/// which can over-detect during deep reorgs.
pub fn is_in_same_chain<S: ChainStore>(store: &S, b1: &Block, b2: &Block) -> bool {
    if b1.height == b2.height {
        return false;
    }

    let (mut higher, lower) = if b1.height > b2.height {
        (b1.clone(), b2)
    } else {
        (b2.clone(), b1)
    };

    while higher.height > 0 {
        let by_hash = store.read_closed_block(&higher.prev_hash);
        let by_header = store.read_closed_block_without_tx(&higher.prev_hash_without_tx);
        higher = match by_hash.or(by_header) {
            Some(parent) => parent,
            None => return false,
        };
        if higher.hash == lower.hash {
            return true;
        }
        if higher.height <= lower.height {
            return false;
        }
    }
    false
}
