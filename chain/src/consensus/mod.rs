//! The consensus core: block lifecycle, chain management and the
//! supporting state machines.

pub mod apply;
pub mod assembly;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod longest_chain;
pub mod params;
pub mod retarget;
pub mod rollback;
pub mod slashing;
pub mod validate;

pub use assembly::new_block;
pub use engine::{ChainEngine, ValidatorKeys};
pub use error::{ChainError, ValidationError};
pub use finalize::{PosContext, finalize_block, pos_hash, satisfies_target};
pub use params::{ParameterRegistry, Parameters};
pub use retarget::DifficultyRetargeter;
pub use slashing::SlashingProof;
pub use validate::BlockData;

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixture: a single-validator engine over an in-memory
    //! store, with two funded user accounts and the transport side of
    //! the bus held by the test.

    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use crate::bus::{self, NodeInbox, TransportHandle};
    use crate::config::ConsensusConfig;
    use crate::storage::{ChainStore, InMemoryChainStore};
    use crate::types::{
        Account, AccountId, Address, Block, FundsTx, Sig, Transaction, current_unix_timestamp,
    };

    use super::engine::{ChainEngine, ValidatorKeys};
    use super::finalize::{PosContext, finalize_block};

    pub(crate) struct TestChain {
        pub engine: ChainEngine<InMemoryChainStore>,
        pub transport: TransportHandle,
        #[allow(dead_code)]
        pub inbox: NodeInbox,
        pub key_a: SigningKey,
        pub key_b: SigningKey,
        pub id_a: AccountId,
        pub id_b: AccountId,
    }

    impl TestChain {
        pub fn config() -> ConsensusConfig {
            ConsensusConfig {
                fee_minimum: 1,
                block_size: 100_000,
                diff_interval: 10,
                block_interval: 15,
                block_reward: 5,
                staking_minimum: 100,
                waiting_minimum: 0,
                accepted_time_diff: 3_600,
                slashing_window_size: 100,
                slash_reward: 2,
                num_included_prev_proofs: 5,
                initial_difficulty: 0,
                block_fetch_timeout: Duration::from_millis(100),
                tx_fetch_timeout: Duration::from_millis(100),
            }
        }

        pub fn new() -> Self {
            Self::with_config(Self::config())
        }

        pub fn with_config(cfg: ConsensusConfig) -> Self {
            let (net, inbox, transport) = bus::channels();
            let keys = ValidatorKeys::single_validator();
            let mut engine =
                ChainEngine::init(cfg, InMemoryChainStore::new(), keys, net).expect("engine init");

            let key_a = SigningKey::from_bytes(&[11u8; 32]);
            let key_b = SigningKey::from_bytes(&[22u8; 32]);
            let mut acc_a = Account::new(Address::from_verifying_key(&key_a.verifying_key()));
            acc_a.balance = 1_000;
            let acc_b = Account::new(Address::from_verifying_key(&key_b.verifying_key()));
            let (id_a, id_b) = (acc_a.id(), acc_b.id());
            engine.store_mut().put_account(acc_a);
            engine.store_mut().put_account(acc_b);

            TestChain {
                engine,
                transport,
                inbox,
                key_a,
                key_b,
                id_a,
                id_b,
            }
        }

        /// Signed transfer from account A to account B.
        pub fn funds_tx(&self, amount: u64, fee: u64, tx_cnt: u64) -> Transaction {
            let mut tx =
                Transaction::Funds(FundsTx::new(amount, fee, tx_cnt, self.id_a, self.id_b));
            tx.sign(&self.key_a);
            tx
        }

        /// Mines one block on the current head through the real
        /// candidate/finalize/validate pipeline.
        pub fn mine(&mut self) -> Block {
            let (mut block, ctx) = self.engine.next_candidate().expect("candidate");
            finalize_block(
                &mut block,
                &ctx,
                &self.engine.keys.commitment,
                current_unix_timestamp(),
            )
            .expect("finalize at difficulty 0");
            self.engine
                .validate(block.clone(), true)
                .expect("validate mined block");
            block
        }

        /// Seals an empty competing block on `parent` without touching
        /// the engine. `salt` lands in the nonce so competing siblings
        /// get distinct hashes.
        pub fn build_empty_on(&self, parent: &Block, salt: u64) -> Block {
            self.build_on(parent, &[], salt)
        }

        /// Seals a block on `parent` referencing the given funds
        /// transfers, bypassing the engine's own assembly.
        pub fn build_on(&self, parent: &Block, funds: &[Transaction], salt: u64) -> Block {
            let mut block = Block::new(
                parent.hash,
                parent.hash_without_tx,
                Sig::default(),
                parent.height + 1,
            );
            block.beneficiary = self.engine.keys.validator_id();
            block.nonce = salt;
            for tx in funds {
                block.funds_tx_data.push(tx.hash());
            }
            block.update_merkle_root();

            let params = self.engine.active_params();
            let ctx = PosContext {
                prev_timestamp: parent.timestamp,
                difficulty: self.engine.current_difficulty(),
                hashed_seed: self.engine.keys.hashed_seed(),
                seed: self.engine.keys.seed,
                prev_proofs: self
                    .engine
                    .prev_commitment_proofs(parent, params.num_included_prev_proofs),
                accepted_time_diff: params.accepted_time_diff,
            };
            finalize_block(
                &mut block,
                &ctx,
                &self.engine.keys.commitment,
                current_unix_timestamp(),
            )
            .expect("seal competing block");
            block
        }
    }
}
