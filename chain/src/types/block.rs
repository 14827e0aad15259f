//! Block structure, canonical layout and hashing.
//!
//! Two hashes are maintained for every block. The full `hash` covers the
//! entire canonical serialization including the six per-kind arrays of
//! transaction hashes; `hash_without_tx` covers the fixed-width header
//! only, which lets light clients follow the chain without transaction
//! data.
//!
//! The canonical layout is hand-assembled and fixed-width (SHA-256 is
//! computed over these exact bytes); bincode 2 is only the container
//! format for storage and the wire.

use serde::{Deserialize, Serialize};

use super::{AccountId, Hash256, Sig, TxKind};

/// A block: fixed header plus six per-kind arrays of transaction hashes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// SHA-256 over the full canonical serialization. Zero for genesis.
    pub hash: Hash256,
    /// SHA-256 over the header only. Zero for genesis.
    pub hash_without_tx: Hash256,
    /// Full hash of the parent block.
    pub prev_hash: Hash256,
    /// Header-only hash of the parent block.
    pub prev_hash_without_tx: Hash256,
    /// Merkle root over all included transaction hashes.
    pub merkle_root: Hash256,
    /// Validator that produced and is rewarded for this block.
    pub beneficiary: AccountId,
    pub height: u32,
    pub timestamp: i64,
    /// PoS difficulty target: required leading zero bits of the lottery hash.
    pub difficulty: u8,
    pub nonce: u64,
    /// Ed25519 signature over the hashed staking seed, binding the block
    /// to the beneficiary's commitment key.
    pub commitment_proof: Sig,
    /// Staking-seed preimage revealed by the producer.
    pub seed: Hash256,
    /// SHA-256 of `seed`; must match the beneficiary's registered seed.
    pub hashed_seed: Hash256,
    pub acc_tx_data: Vec<Hash256>,
    pub funds_tx_data: Vec<Hash256>,
    pub config_tx_data: Vec<Hash256>,
    pub stake_tx_data: Vec<Hash256>,
    pub agg_tx_data: Vec<Hash256>,
    pub iot_tx_data: Vec<Hash256>,
}

impl Block {
    /// Returns an empty candidate with parent links set.
    pub fn new(
        prev_hash: Hash256,
        prev_hash_without_tx: Hash256,
        commitment_proof: Sig,
        height: u32,
    ) -> Self {
        Block {
            hash: Hash256::zero(),
            hash_without_tx: Hash256::zero(),
            prev_hash,
            prev_hash_without_tx,
            merkle_root: Hash256::zero(),
            beneficiary: AccountId::default(),
            height,
            timestamp: 0,
            difficulty: 0,
            nonce: 0,
            commitment_proof,
            seed: Hash256::zero(),
            hashed_seed: Hash256::zero(),
            acc_tx_data: Vec::new(),
            funds_tx_data: Vec::new(),
            config_tx_data: Vec::new(),
            stake_tx_data: Vec::new(),
            agg_tx_data: Vec::new(),
            iot_tx_data: Vec::new(),
        }
    }

    /// The genesis block: all hashes zero, timestamp zero.
    ///
    /// Every node starts with this identical block, which guarantees a
    /// universally shared common ancestor for the longest-chain search.
    pub fn genesis() -> Self {
        Block::new(Hash256::zero(), Hash256::zero(), Sig::default(), 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.hash.is_zero()
    }

    /// Fixed-width canonical header layout:
    ///
    /// `beneficiary 32 | height 4 | timestamp 8 | prev_hash 32 |
    ///  prev_hash_without_tx 32 | merkle 32 | difficulty 1 | nonce 8 |
    ///  commitment_proof 64 | hashed_seed 32 | seed 32`
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(277);
        buf.extend_from_slice(self.beneficiary.as_hash().as_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(self.prev_hash_without_tx.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.push(self.difficulty);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.commitment_proof.to_fixed());
        buf.extend_from_slice(self.hashed_seed.as_bytes());
        buf.extend_from_slice(self.seed.as_bytes());
        buf
    }

    /// Canonical serialization: header followed by the six length-prefixed
    /// arrays of 32-byte transaction hashes in kind order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = self.header_bytes();
        for kind in TxKind::ALL {
            let data = self.tx_data(kind);
            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
            for h in data {
                buf.extend_from_slice(h.as_bytes());
            }
        }
        buf
    }

    /// Computes the full block hash over [`Block::canonical_bytes`].
    pub fn compute_hash(&self) -> Hash256 {
        Hash256::compute(&self.canonical_bytes())
    }

    /// Computes the header-only hash over [`Block::header_bytes`].
    pub fn compute_hash_without_tx(&self) -> Hash256 {
        Hash256::compute(&self.header_bytes())
    }

    /// Seals both hashes into the block.
    pub fn seal(&mut self) {
        self.hash = self.compute_hash();
        self.hash_without_tx = self.compute_hash_without_tx();
    }

    /// Recomputes and installs the Merkle root over the included hashes.
    pub fn update_merkle_root(&mut self) {
        self.merkle_root = merkle_root(&self.all_tx_hashes());
    }

    /// The per-kind hash array for `kind`.
    pub fn tx_data(&self, kind: TxKind) -> &[Hash256] {
        match kind {
            TxKind::Acc => &self.acc_tx_data,
            TxKind::Funds => &self.funds_tx_data,
            TxKind::Config => &self.config_tx_data,
            TxKind::Stake => &self.stake_tx_data,
            TxKind::Agg => &self.agg_tx_data,
            TxKind::Iot => &self.iot_tx_data,
        }
    }

    pub fn tx_data_mut(&mut self, kind: TxKind) -> &mut Vec<Hash256> {
        match kind {
            TxKind::Acc => &mut self.acc_tx_data,
            TxKind::Funds => &mut self.funds_tx_data,
            TxKind::Config => &mut self.config_tx_data,
            TxKind::Stake => &mut self.stake_tx_data,
            TxKind::Agg => &mut self.agg_tx_data,
            TxKind::Iot => &mut self.iot_tx_data,
        }
    }

    /// All referenced transaction hashes in canonical array order.
    pub fn all_tx_hashes(&self) -> Vec<Hash256> {
        let mut out = Vec::with_capacity(self.tx_count());
        for kind in TxKind::ALL {
            out.extend_from_slice(self.tx_data(kind));
        }
        out
    }

    /// Number of transaction hashes referenced across all six arrays.
    pub fn tx_count(&self) -> usize {
        TxKind::ALL.iter().map(|k| self.tx_data(*k).len()).sum()
    }

    /// Canonical byte representation for the wire and for storage.
    pub fn encode(&self) -> Vec<u8> {
        let cfg = bincode::config::standard();
        bincode::serde::encode_to_vec(self, cfg)
            .expect("Block should always be serializable with bincode 2 + serde")
    }

    /// Decodes a block from its canonical byte representation.
    pub fn decode(bytes: &[u8]) -> Option<Block> {
        let cfg = bincode::config::standard();
        let (block, _): (Block, usize) = bincode::serde::decode_from_slice(bytes, cfg).ok()?;
        Some(block)
    }
}

/// Merkle root over a list of transaction hashes.
///
/// Pairs are combined with SHA-256; an odd node is paired with itself.
/// The empty list maps to the zero hash (a block with no transactions).
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::zero();
    }

    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(left.as_bytes());
            buf[32..].copy_from_slice(right.as_bytes());
            next.push(Hash256::compute(&buf));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_LEN;

    fn dummy_hash(byte: u8) -> Hash256 {
        Hash256([byte; HASH_LEN])
    }

    fn dummy_block() -> Block {
        let mut b = Block::new(dummy_hash(1), dummy_hash(2), Sig(vec![3u8; 64]), 5);
        b.beneficiary = AccountId(dummy_hash(4));
        b.timestamp = 1_700_000_000;
        b.difficulty = 8;
        b.funds_tx_data = vec![dummy_hash(10), dummy_hash(11)];
        b.iot_tx_data = vec![dummy_hash(12)];
        b.update_merkle_root();
        b
    }

    #[test]
    fn canonical_layout_has_fixed_header_width() {
        let b = dummy_block();
        assert_eq!(b.header_bytes().len(), 277);
        // header + six 4-byte counts + three 32-byte hashes
        assert_eq!(b.canonical_bytes().len(), 277 + 6 * 4 + 3 * 32);
    }

    #[test]
    fn hash_is_deterministic_and_covers_tx_arrays() {
        let b = dummy_block();
        assert_eq!(b.compute_hash(), b.compute_hash());

        let mut modified = b.clone();
        modified.funds_tx_data.push(dummy_hash(99));
        assert_ne!(b.compute_hash(), modified.compute_hash());
        // Header-only hash ignores the arrays.
        assert_eq!(b.compute_hash_without_tx(), modified.compute_hash_without_tx());
    }

    #[test]
    fn genesis_is_all_zero() {
        let g = Block::genesis();
        assert!(g.is_genesis());
        assert!(g.hash.is_zero());
        assert!(g.hash_without_tx.is_zero());
        assert!(g.prev_hash.is_zero());
        assert_eq!(g.timestamp, 0);
        assert_eq!(g.tx_count(), 0);
    }

    #[test]
    fn block_roundtrips_with_bincode2() {
        let mut b = dummy_block();
        b.seal();
        let decoded = Block::decode(&b.encode()).expect("Block decode");
        assert_eq!(decoded, b);
        assert_eq!(decoded.compute_hash(), b.hash);
    }

    #[test]
    fn merkle_root_of_empty_is_zero() {
        assert!(merkle_root(&[]).is_zero());
    }

    #[test]
    fn merkle_root_handles_odd_counts() {
        let one = merkle_root(&[dummy_hash(1)]);
        assert_eq!(one, dummy_hash(1));

        let three = merkle_root(&[dummy_hash(1), dummy_hash(2), dummy_hash(3)]);
        let two = merkle_root(&[dummy_hash(1), dummy_hash(2)]);
        assert_ne!(three, two);
    }

    #[test]
    fn merkle_root_depends_on_order() {
        let ab = merkle_root(&[dummy_hash(1), dummy_hash(2)]);
        let ba = merkle_root(&[dummy_hash(2), dummy_hash(1)]);
        assert_ne!(ab, ba);
    }
}
