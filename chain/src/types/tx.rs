//! Transaction types for the consensus layer.
//!
//! This module defines the six concrete transaction payloads used by the
//! chain along with a tagged [`Transaction`] enum. Every payload carries
//! a one-byte header, a fee, and a detached ed25519 signature; the
//! canonical 32-byte content hash of a transaction is computed over a
//! projection that excludes the signature, so signing never changes the
//! identity of a transaction.
//!
//! Wire and storage serialization is done with **bincode 2** via the
//! `serde` integration; the hashed projection is a hand-assembled
//! fixed-width layout so the content hash is stable across nodes.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use super::{AccountId, COMM_KEY_LEN, Hash256, Sig};

/// Discriminant for the six transaction kinds.
///
/// The numeric value doubles as the canonical header prefix of the
/// hashed projection and as the order of the per-kind hash arrays in a
/// block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TxKind {
    Acc,
    Funds,
    Config,
    Stake,
    Agg,
    Iot,
}

impl TxKind {
    /// All kinds in canonical block-array order.
    pub const ALL: [TxKind; 6] = [
        TxKind::Acc,
        TxKind::Funds,
        TxKind::Config,
        TxKind::Stake,
        TxKind::Agg,
        TxKind::Iot,
    ];

    /// One-byte tag used in the hashed projection.
    pub fn tag(self) -> u8 {
        match self {
            TxKind::Acc => 0,
            TxKind::Funds => 1,
            TxKind::Config => 2,
            TxKind::Stake => 3,
            TxKind::Agg => 4,
            TxKind::Iot => 5,
        }
    }
}

/// Plain funds transfer between two accounts.
///
/// Debits `amount + fee` from the sender, credits `amount` to the
/// receiver, and advances the sender's transaction counter by one. The
/// counter (`tx_cnt`) must equal the sender's next expected value or the
/// transfer is rejected.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FundsTx {
    pub header: u8,
    pub amount: u64,
    pub fee: u64,
    pub tx_cnt: u64,
    pub from: AccountId,
    pub to: AccountId,
    pub sig: Sig,
}

impl FundsTx {
    pub fn new(amount: u64, fee: u64, tx_cnt: u64, from: AccountId, to: AccountId) -> Self {
        FundsTx {
            header: 0,
            amount,
            fee,
            tx_cnt,
            from,
            to,
            sig: Sig::default(),
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 1 + 8 * 3 + 32 * 2);
        buf.push(TxKind::Funds.tag());
        buf.push(self.header);
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&self.tx_cnt.to_be_bytes());
        buf.extend_from_slice(self.from.as_hash().as_bytes());
        buf.extend_from_slice(self.to.as_hash().as_bytes());
        buf
    }

    /// Canonical content hash (signature excluded).
    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Creates a new account, authorized by a root signature.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccTx {
    pub header: u8,
    /// Root account that authorized the creation.
    pub issuer: AccountId,
    pub fee: u64,
    /// Compressed ed25519 public key of the account being created.
    pub pub_key: [u8; COMM_KEY_LEN],
    pub sig: Sig,
}

impl AccTx {
    pub fn new(issuer: AccountId, fee: u64, pub_key: [u8; COMM_KEY_LEN]) -> Self {
        AccTx {
            header: 0,
            issuer,
            fee,
            pub_key,
            sig: Sig::default(),
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 32 + 8 + COMM_KEY_LEN);
        buf.push(TxKind::Acc.tag());
        buf.push(self.header);
        buf.extend_from_slice(self.issuer.as_hash().as_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&self.pub_key);
        buf
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Proposes a consensus-parameter change.
///
/// Takes effect at the block that includes it. Unknown parameter ids are
/// recorded but change nothing, so nodes running older code stay in
/// consensus with newer proposers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConfigTx {
    pub header: u8,
    /// Which parameter this change targets (see `consensus::params`).
    pub id: u8,
    /// New value of the parameter.
    pub payload: u64,
    pub fee: u64,
    pub tx_cnt: u64,
    pub sig: Sig,
}

impl ConfigTx {
    pub fn new(id: u8, payload: u64, fee: u64, tx_cnt: u64) -> Self {
        ConfigTx {
            header: 0,
            id,
            payload,
            fee,
            tx_cnt,
            sig: Sig::default(),
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + 8 * 3);
        buf.push(TxKind::Config.tag());
        buf.push(self.header);
        buf.push(self.id);
        buf.extend_from_slice(&self.payload.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&self.tx_cnt.to_be_bytes());
        buf
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Toggles an account's staking flag and publishes its commitment key
/// and hashed staking seed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StakeTx {
    pub header: u8,
    pub fee: u64,
    pub is_staking: bool,
    pub account: AccountId,
    pub commitment_key: [u8; COMM_KEY_LEN],
    pub hashed_seed: Hash256,
    pub sig: Sig,
}

impl StakeTx {
    pub fn new(
        fee: u64,
        is_staking: bool,
        account: AccountId,
        commitment_key: [u8; COMM_KEY_LEN],
        hashed_seed: Hash256,
    ) -> Self {
        StakeTx {
            header: 0,
            fee,
            is_staking,
            account,
            commitment_key,
            hashed_seed,
            sig: Sig::default(),
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + 8 + 32 * 3);
        buf.push(TxKind::Stake.tag());
        buf.push(self.header);
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.push(self.is_staking as u8);
        buf.extend_from_slice(self.account.as_hash().as_bytes());
        buf.extend_from_slice(&self.commitment_key);
        buf.extend_from_slice(self.hashed_seed.as_bytes());
        buf
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Container that logically replaces a run of funds transfers from one
/// sender with a single inclusion.
///
/// The cargo hashes reference funds transactions that must individually
/// pass admission; the container itself carries no fee and no signature
/// (its children are already signed). On rollback the container is
/// destroyed and its children reopen.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AggTx {
    /// Sum of the aggregated transfer amounts.
    pub amount: u64,
    /// Common sender of every aggregated transfer.
    pub from: AccountId,
    /// Content hashes of the replaced funds transactions.
    pub aggregated: Vec<Hash256>,
}

impl AggTx {
    pub fn new(amount: u64, from: AccountId, aggregated: Vec<Hash256>) -> Self {
        AggTx {
            amount,
            from,
            aggregated,
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 32 + 4 + 32 * self.aggregated.len());
        buf.push(TxKind::Agg.tag());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(self.from.as_hash().as_bytes());
        buf.extend_from_slice(&(self.aggregated.len() as u32).to_be_bytes());
        for h in &self.aggregated {
            buf.extend_from_slice(h.as_bytes());
        }
        buf
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Lightweight data-carrying transaction from an IoT device.
///
/// Exempt from the fee minimum; its fee is not collected by the block
/// beneficiary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IotTx {
    pub header: u8,
    pub tx_cnt: u64,
    pub from: AccountId,
    pub to: AccountId,
    pub payload: Vec<u8>,
    pub fee: u64,
    pub sig: Sig,
}

impl IotTx {
    pub fn new(tx_cnt: u64, from: AccountId, to: AccountId, payload: Vec<u8>, fee: u64) -> Self {
        IotTx {
            header: 0,
            tx_cnt,
            from,
            to,
            payload,
            fee,
            sig: Sig::default(),
        }
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 8 * 2 + 32 * 2 + 4 + self.payload.len());
        buf.push(TxKind::Iot.tag());
        buf.push(self.header);
        buf.extend_from_slice(&self.tx_cnt.to_be_bytes());
        buf.extend_from_slice(self.from.as_hash().as_bytes());
        buf.extend_from_slice(self.to.as_hash().as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::compute(&self.unsigned_bytes())
    }
}

/// Top-level transaction enum.
///
/// This is the type that appears in mempool structures and on the wire.
/// For binary formats (bincode 2) we use the default externally-tagged
/// representation, which is supported by `bincode::serde`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transaction {
    Acc(AccTx),
    Funds(FundsTx),
    Config(ConfigTx),
    Stake(StakeTx),
    Agg(AggTx),
    Iot(IotTx),
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Acc(_) => TxKind::Acc,
            Transaction::Funds(_) => TxKind::Funds,
            Transaction::Config(_) => TxKind::Config,
            Transaction::Stake(_) => TxKind::Stake,
            Transaction::Agg(_) => TxKind::Agg,
            Transaction::Iot(_) => TxKind::Iot,
        }
    }

    /// Canonical content hash (signature excluded).
    pub fn hash(&self) -> Hash256 {
        match self {
            Transaction::Acc(tx) => tx.hash(),
            Transaction::Funds(tx) => tx.hash(),
            Transaction::Config(tx) => tx.hash(),
            Transaction::Stake(tx) => tx.hash(),
            Transaction::Agg(tx) => tx.hash(),
            Transaction::Iot(tx) => tx.hash(),
        }
    }

    /// Fee contributed to the block beneficiary.
    ///
    /// Aggregate containers and IoT transactions contribute nothing.
    pub fn collectible_fee(&self) -> u64 {
        match self {
            Transaction::Acc(tx) => tx.fee,
            Transaction::Funds(tx) => tx.fee,
            Transaction::Config(tx) => tx.fee,
            Transaction::Stake(tx) => tx.fee,
            Transaction::Agg(_) | Transaction::Iot(_) => 0,
        }
    }

    /// Declared fee of the payload, whatever its kind.
    pub fn fee(&self) -> u64 {
        match self {
            Transaction::Acc(tx) => tx.fee,
            Transaction::Funds(tx) => tx.fee,
            Transaction::Config(tx) => tx.fee,
            Transaction::Stake(tx) => tx.fee,
            Transaction::Agg(_) => 0,
            Transaction::Iot(tx) => tx.fee,
        }
    }

    /// Account this transaction debits or acts on behalf of.
    pub fn sender(&self) -> Option<AccountId> {
        match self {
            Transaction::Acc(tx) => Some(tx.issuer),
            Transaction::Funds(tx) => Some(tx.from),
            Transaction::Config(_) => None,
            Transaction::Stake(tx) => Some(tx.account),
            Transaction::Agg(tx) => Some(tx.from),
            Transaction::Iot(tx) => Some(tx.from),
        }
    }

    /// Account this transaction credits, if any.
    pub fn receiver(&self) -> Option<AccountId> {
        match self {
            Transaction::Funds(tx) => Some(tx.to),
            Transaction::Iot(tx) => Some(tx.to),
            _ => None,
        }
    }

    /// Detached signature, for the kinds that carry one.
    pub fn signature(&self) -> Option<&Sig> {
        match self {
            Transaction::Acc(tx) => Some(&tx.sig),
            Transaction::Funds(tx) => Some(&tx.sig),
            Transaction::Config(tx) => Some(&tx.sig),
            Transaction::Stake(tx) => Some(&tx.sig),
            Transaction::Agg(_) => None,
            Transaction::Iot(tx) => Some(&tx.sig),
        }
    }

    /// Signs the transaction in place with `key`.
    ///
    /// The signature covers the canonical content hash, so it stays
    /// valid as long as the non-signature fields do not change.
    pub fn sign(&mut self, key: &ed25519_dalek::SigningKey) {
        let digest = self.hash();
        let sig: Sig = key.sign(digest.as_bytes()).into();
        match self {
            Transaction::Acc(tx) => tx.sig = sig,
            Transaction::Funds(tx) => tx.sig = sig,
            Transaction::Config(tx) => tx.sig = sig,
            Transaction::Stake(tx) => tx.sig = sig,
            Transaction::Agg(_) => {}
            Transaction::Iot(tx) => tx.sig = sig,
        }
    }

    /// Verifies the detached signature against a compressed public key.
    ///
    /// Aggregate containers are unsigned and always verify; their cargo
    /// is checked individually.
    pub fn verify_signature(&self, pk: &[u8; COMM_KEY_LEN]) -> bool {
        let Some(sig) = self.signature() else {
            return true;
        };
        let Some(sig) = sig.to_dalek() else {
            return false;
        };
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(pk) else {
            return false;
        };
        vk.verify(self.hash().as_bytes(), &sig).is_ok()
    }

    /// Canonical byte representation for the wire and for storage.
    pub fn encode(&self) -> Vec<u8> {
        let cfg = bincode::config::standard();
        bincode::serde::encode_to_vec(self, cfg)
            .expect("Transaction should always be serializable with bincode 2 + serde")
    }

    /// Decodes a transaction from its canonical byte representation.
    pub fn decode(bytes: &[u8]) -> Option<Transaction> {
        let cfg = bincode::config::standard();
        let (tx, _): (Transaction, usize) = bincode::serde::decode_from_slice(bytes, cfg).ok()?;
        Some(tx)
    }
}
