//! Block finalization: the PoS lottery and sealing.
//!
//! The lottery input concatenates the producer's hashed staking seed,
//! the previous block hash, the beneficiary, the candidate timestamp and
//! the last N commitment proofs. A block wins iff the SHA-256 of that
//! input has at least `difficulty` leading zero bits, i.e. lies below
//! `2^(256 - difficulty)`. The search variable is the timestamp, which
//! the miner advances monotonically within the accepted future window.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use crate::types::{AccountId, Block, COMM_KEY_LEN, Hash256, Sig};

use super::error::ValidationError;

/// Everything the grind needs, snapshotted under the latch so the search
/// itself can run outside it.
#[derive(Clone, Debug)]
pub struct PosContext {
    /// Timestamp of the parent block; candidates never go below it.
    pub prev_timestamp: i64,
    /// Difficulty the retargeter expects for the candidate.
    pub difficulty: u8,
    /// The producer's registered hashed staking seed.
    pub hashed_seed: Hash256,
    /// Preimage of `hashed_seed`, revealed in the sealed block.
    pub seed: Hash256,
    /// Commitment proofs of the last `num_included_prev_proofs` blocks,
    /// newest first.
    pub prev_proofs: Vec<Sig>,
    /// Seconds the sealed timestamp may lie in the future.
    pub accepted_time_diff: u64,
}

/// The PoS lottery hash for one candidate timestamp.
pub fn pos_hash(
    hashed_seed: &Hash256,
    prev_hash: &Hash256,
    beneficiary: &AccountId,
    timestamp: i64,
    prev_proofs: &[Sig],
) -> Hash256 {
    let mut buf = Vec::with_capacity(32 * 3 + 8 + prev_proofs.len() * 64);
    buf.extend_from_slice(hashed_seed.as_bytes());
    buf.extend_from_slice(prev_hash.as_bytes());
    buf.extend_from_slice(beneficiary.as_hash().as_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    for proof in prev_proofs {
        buf.extend_from_slice(&proof.to_fixed());
    }
    Hash256::compute(&buf)
}

/// Number of leading zero bits of a hash.
pub fn leading_zero_bits(h: &Hash256) -> u32 {
    let mut zeros = 0u32;
    for byte in h.as_bytes() {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// `2^(256 - difficulty) > H(input)` expressed over leading zero bits.
pub fn satisfies_target(h: &Hash256, difficulty: u8) -> bool {
    leading_zero_bits(h) >= difficulty as u32
}

/// Verifies a commitment proof: an ed25519 signature over the hashed
/// staking seed under the validator's commitment key.
pub fn verify_commitment_proof(
    proof: &Sig,
    commitment_key: &[u8; COMM_KEY_LEN],
    hashed_seed: &Hash256,
) -> bool {
    let Some(sig) = proof.to_dalek() else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(commitment_key) else {
        return false;
    };
    vk.verify(hashed_seed.as_bytes(), &sig).is_ok()
}

/// Searches timestamps for a winning lottery draw and seals the block.
///
/// The search starts at `max(now, prev_timestamp)` and walks forward
/// second by second through the accepted future window. No draw in the
/// window means this round loses; the miner retries once the window has
/// moved.
pub fn finalize_block(
    b: &mut Block,
    ctx: &PosContext,
    commitment: &SigningKey,
    now: i64,
) -> Result<(), ValidationError> {
    let start = now.max(ctx.prev_timestamp);
    let end = now.saturating_add(ctx.accepted_time_diff as i64);

    for ts in start..=end {
        let draw = pos_hash(&ctx.hashed_seed, &b.prev_hash, &b.beneficiary, ts, &ctx.prev_proofs);
        if !satisfies_target(&draw, ctx.difficulty) {
            continue;
        }

        b.timestamp = ts;
        b.difficulty = ctx.difficulty;
        b.seed = ctx.seed;
        b.hashed_seed = ctx.hashed_seed;
        b.commitment_proof = commitment.sign(ctx.hashed_seed.as_bytes()).into();
        b.seal();
        return Ok(());
    }

    Err(ValidationError::Invalid(
        "no winning lottery timestamp inside the accepted window",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_LEN;

    fn dummy_hash(byte: u8) -> Hash256 {
        Hash256([byte; HASH_LEN])
    }

    fn dummy_key(byte: u8) -> SigningKey {
        SigningKey::from_bytes(&[byte; 32])
    }

    fn context(difficulty: u8) -> PosContext {
        let seed = dummy_hash(7);
        PosContext {
            prev_timestamp: 1_000,
            difficulty,
            hashed_seed: Hash256::compute(seed.as_bytes()),
            seed,
            prev_proofs: vec![Sig(vec![1u8; 64]), Sig(vec![2u8; 64])],
            accepted_time_diff: 600,
        }
    }

    #[test]
    fn leading_zero_bits_counts_correctly() {
        assert_eq!(leading_zero_bits(&Hash256::zero()), 256);
        assert_eq!(leading_zero_bits(&Hash256([0xFF; HASH_LEN])), 0);

        let mut h = [0u8; HASH_LEN];
        h[0] = 0b0000_0100;
        assert_eq!(leading_zero_bits(&Hash256(h)), 5);

        let mut h2 = [0u8; HASH_LEN];
        h2[1] = 0b1000_0000;
        assert_eq!(leading_zero_bits(&Hash256(h2)), 8);
    }

    #[test]
    fn difficulty_zero_accepts_any_draw() {
        assert!(satisfies_target(&Hash256([0xFF; HASH_LEN]), 0));
        assert!(!satisfies_target(&Hash256([0xFF; HASH_LEN]), 1));
    }

    #[test]
    fn pos_hash_depends_on_every_input() {
        let base = pos_hash(&dummy_hash(1), &dummy_hash(2), &AccountId(dummy_hash(3)), 10, &[]);
        assert_ne!(
            base,
            pos_hash(&dummy_hash(1), &dummy_hash(2), &AccountId(dummy_hash(3)), 11, &[])
        );
        assert_ne!(
            base,
            pos_hash(&dummy_hash(9), &dummy_hash(2), &AccountId(dummy_hash(3)), 10, &[])
        );
        assert_ne!(
            base,
            pos_hash(
                &dummy_hash(1),
                &dummy_hash(2),
                &AccountId(dummy_hash(3)),
                10,
                &[Sig(vec![5u8; 64])]
            )
        );
    }

    #[test]
    fn finalize_seals_a_winning_block_at_difficulty_zero() {
        let ctx = context(0);
        let key = dummy_key(3);
        let mut b = Block::new(dummy_hash(1), dummy_hash(2), Sig::default(), 1);
        b.beneficiary = AccountId(dummy_hash(4));

        finalize_block(&mut b, &ctx, &key, 2_000).expect("difficulty 0 always wins");

        assert!(b.timestamp >= 2_000);
        assert_eq!(b.hash, b.compute_hash());
        assert_eq!(b.hash_without_tx, b.compute_hash_without_tx());
        assert!(verify_commitment_proof(
            &b.commitment_proof,
            key.verifying_key().as_bytes(),
            &ctx.hashed_seed
        ));

        let draw = pos_hash(&ctx.hashed_seed, &b.prev_hash, &b.beneficiary, b.timestamp, &ctx.prev_proofs);
        assert!(satisfies_target(&draw, ctx.difficulty));
    }

    #[test]
    fn finalize_never_goes_below_parent_timestamp() {
        let mut ctx = context(0);
        ctx.prev_timestamp = 5_000;
        let mut b = Block::new(dummy_hash(1), dummy_hash(2), Sig::default(), 1);
        finalize_block(&mut b, &ctx, &dummy_key(3), 2_000).expect("wins");
        assert!(b.timestamp >= 5_000);
    }

    #[test]
    fn impossible_difficulty_exhausts_the_window() {
        let mut ctx = context(255);
        ctx.accepted_time_diff = 3;
        let mut b = Block::new(dummy_hash(1), dummy_hash(2), Sig::default(), 1);
        assert!(finalize_block(&mut b, &ctx, &dummy_key(3), 2_000).is_err());
    }

    #[test]
    fn commitment_proof_rejects_wrong_key() {
        let ctx = context(0);
        let key = dummy_key(3);
        let mut b = Block::new(dummy_hash(1), dummy_hash(2), Sig::default(), 1);
        finalize_block(&mut b, &ctx, &key, 2_000).expect("wins");

        let other = dummy_key(4);
        assert!(!verify_commitment_proof(
            &b.commitment_proof,
            other.verifying_key().as_bytes(),
            &ctx.hashed_seed
        ));
    }
}
