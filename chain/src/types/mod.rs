//! Core domain types used by the chain.
//!
//! This module defines strongly-typed hashes, account addresses and
//! identifiers, and signature material that are shared across the chain
//! implementation. The goal is to avoid "naked" byte buffers in public
//! APIs and instead use domain-specific newtypes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Account record kept in the world state.
pub mod account;
/// Block structure, canonical layout and hashing.
pub mod block;
/// The six transaction kinds and their tagged enum.
pub mod tx;

pub use account::Account;
pub use block::Block;
pub use tx::{AccTx, AggTx, ConfigTx, FundsTx, IotTx, StakeTx, Transaction, TxKind};

/// Length in bytes of all 256-bit hash types used in this module.
pub const HASH_LEN: usize = 32;

/// Length in bytes of an account address (two zero-padded ed25519
/// public-key coordinates).
pub const ADDRESS_LEN: usize = 64;

/// Length in bytes of an ed25519 commitment public key.
pub const COMM_KEY_LEN: usize = 32;

/// Length in bytes of an ed25519 commitment proof (detached signature).
pub const COMM_PROOF_LEN: usize = 64;

/// Strongly-typed 256-bit hash wrapper (SHA-256).
///
/// This type is used as the backing representation for all fixed-size
/// hashes in the chain: block hashes, transaction content hashes, account
/// identifiers and staking seeds. It is always exactly [`HASH_LEN`] bytes.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Hash256(pub [u8; HASH_LEN]);

impl Hash256 {
    /// Computes a new [`Hash256`] as the SHA-256 hash of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash256(hasher.finalize().into())
    }

    /// The all-zero hash. Genesis links and empty Merkle roots use it.
    pub fn zero() -> Self {
        Hash256([0u8; HASH_LEN])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// Returns the underlying 32-byte hash as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hex rendering of the first four bytes, for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[0..4])
    }
}

/// Canonical 64-byte account address.
///
/// The address is the concatenation of the X and Y ed25519 public-key
/// coordinates, zero-padded on the left. For keys carried in compressed
/// 32-byte form the key bytes occupy the right half and the left half
/// stays zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Builds an address from a compressed 32-byte ed25519 public key.
    pub fn from_pubkey_bytes(pk: &[u8; COMM_KEY_LEN]) -> Self {
        let mut addr = [0u8; ADDRESS_LEN];
        addr[ADDRESS_LEN - COMM_KEY_LEN..].copy_from_slice(pk);
        Address(addr)
    }

    /// Builds an address from a dalek verifying key.
    pub fn from_verifying_key(vk: &ed25519_dalek::VerifyingKey) -> Self {
        Self::from_pubkey_bytes(vk.as_bytes())
    }

    /// Identity of this address within the world state.
    pub fn hash(&self) -> AccountId {
        AccountId(Hash256::compute(&self.0))
    }

    /// The compressed ed25519 public key embedded in the right half.
    pub fn pubkey_bytes(&self) -> [u8; COMM_KEY_LEN] {
        let mut pk = [0u8; COMM_KEY_LEN];
        pk.copy_from_slice(&self.0[ADDRESS_LEN - COMM_KEY_LEN..]);
        pk
    }
}

/// Account identifier (SHA-256 hash of the 64-byte address).
///
/// Blocks and transactions refer to accounts by this 32-byte identity,
/// never by the full address.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct AccountId(pub Hash256);

impl AccountId {
    /// Derives an [`AccountId`] from a 64-byte address.
    pub fn from_address(address: &Address) -> Self {
        address.hash()
    }

    /// Returns the underlying [`Hash256`] backing this identifier.
    pub fn as_hash(&self) -> &Hash256 {
        &self.0
    }
}

/// Ed25519 signature bytes, wrapped to avoid naked `Vec<u8>`.
///
/// These are detached signatures over a canonical transaction or seed
/// encoding. An empty wrapper stands for "unsigned" (the genesis proof,
/// freshly assembled candidates).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Sig(pub Vec<u8>);

impl Sig {
    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Interprets the bytes as a dalek signature, if well-formed.
    pub fn to_dalek(&self) -> Option<ed25519_dalek::Signature> {
        ed25519_dalek::Signature::from_slice(&self.0).ok()
    }

    /// Copies the signature into a fixed 64-byte array, zero-padded.
    ///
    /// Canonical block and transaction layouts store proofs at fixed
    /// width, so short or absent signatures serialize as zeros.
    pub fn to_fixed(&self) -> [u8; COMM_PROOF_LEN] {
        let mut out = [0u8; COMM_PROOF_LEN];
        let n = self.0.len().min(COMM_PROOF_LEN);
        out[..n].copy_from_slice(&self.0[..n]);
        out
    }
}

impl From<ed25519_dalek::Signature> for Sig {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Sig(sig.to_bytes().to_vec())
    }
}

/// Returns the current wall-clock time as seconds since Unix epoch.
///
/// On error (system clock before epoch) this falls back to 0.
pub fn current_unix_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash256_is_deterministic() {
        let a = Hash256::compute(b"telemetry");
        let b = Hash256::compute(b"telemetry");
        assert_eq!(a, b);
        assert_ne!(a, Hash256::compute(b"telemetrz"));
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(Hash256::zero().is_zero());
        assert!(!Hash256::compute(b"x").is_zero());
    }

    #[test]
    fn address_pads_pubkey_on_the_left() {
        let pk = [7u8; COMM_KEY_LEN];
        let addr = Address::from_pubkey_bytes(&pk);
        assert_eq!(addr.0[..COMM_KEY_LEN], [0u8; COMM_KEY_LEN]);
        assert_eq!(addr.pubkey_bytes(), pk);
    }

    #[test]
    fn account_id_binds_to_full_address() {
        let a = Address::from_pubkey_bytes(&[1u8; COMM_KEY_LEN]);
        let b = Address::from_pubkey_bytes(&[2u8; COMM_KEY_LEN]);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), AccountId::from_address(&a));
    }

    #[test]
    fn sig_to_fixed_pads_with_zeros() {
        let sig = Sig(vec![0xAB; 10]);
        let fixed = sig.to_fixed();
        assert_eq!(&fixed[..10], &[0xAB; 10]);
        assert_eq!(&fixed[10..], &[0u8; COMM_PROOF_LEN - 10]);
    }
}
