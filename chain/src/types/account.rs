//! Account record kept in the world state.

use super::{AccountId, Address, COMM_KEY_LEN, Hash256};

/// A single account in the world state.
///
/// Accounts are keyed in state by [`AccountId`], the SHA-256 hash of
/// their 64-byte [`Address`]. Balance and transaction counter obey the
/// consensus invariants: the counter increases by exactly one per
/// accepted funds transfer, and balances never go negative.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Account {
    /// Full 64-byte address (zero-padded ed25519 coordinates).
    pub address: Address,
    /// Spendable balance.
    pub balance: u64,
    /// Number of funds transfers this account has sent.
    pub tx_cnt: u64,
    /// Whether the account currently participates in the PoS lottery.
    pub is_staking: bool,
    /// Ed25519 commitment public key published when staking was enabled.
    pub commitment_key: [u8; COMM_KEY_LEN],
    /// SHA-256 of the staking seed the validator committed to.
    pub hashed_seed: Hash256,
    /// Height at which the staking flag was last switched on. Validators
    /// must wait `waiting_minimum` blocks past this before producing.
    pub staking_block_height: u64,
    /// Whether this account may authorize account creation and
    /// parameter changes.
    pub is_root: bool,
}

impl Account {
    /// Creates a fresh, non-staking account with a zero balance.
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            tx_cnt: 0,
            is_staking: false,
            commitment_key: [0u8; COMM_KEY_LEN],
            hashed_seed: Hash256::zero(),
            staking_block_height: 0,
            is_root: false,
        }
    }

    /// The identity this account is keyed by in state.
    pub fn id(&self) -> AccountId {
        self.address.hash()
    }

    /// The compressed ed25519 key transactions of this account are
    /// verified against.
    pub fn pubkey_bytes(&self) -> [u8; COMM_KEY_LEN] {
        self.address.pubkey_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_starts_empty() {
        let addr = Address::from_pubkey_bytes(&[9u8; COMM_KEY_LEN]);
        let acc = Account::new(addr);
        assert_eq!(acc.balance, 0);
        assert_eq!(acc.tx_cnt, 0);
        assert!(!acc.is_staking);
        assert!(!acc.is_root);
        assert_eq!(acc.id(), addr.hash());
    }
}
