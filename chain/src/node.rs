//! Node orchestration: the miner and receiver loops.
//!
//! Two long-lived OS threads share the engine behind a single exclusive
//! lock, the **block-validation latch**: the miner's critical section is
//! candidate assembly (mempool drain + head read) and the validation of
//! its own sealed blocks; the receiver's critical section is the entire
//! validation of a peer block. The PoS grind runs outside the latch, so
//! peer validation never waits on the lottery.
//!
//! A set of short-lived handler threads drains the typed inbound gossip
//! channels, verifying each transaction before it enters the open pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::NodeInbox;
use crate::consensus::finalize::finalize_block;
use crate::consensus::{ChainEngine, ChainError};
use crate::metrics::MetricsRegistry;
use crate::storage::ChainStore;
use crate::types::{Block, Transaction, current_unix_timestamp};

/// How long blocking loops wait per receive before rechecking shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the miner backs off after a losing lottery round.
const LOSING_ROUND_BACKOFF: Duration = Duration::from_secs(1);

/// A running node: the latch plus the thread handles.
pub struct Node<S> {
    latch: Arc<Mutex<ChainEngine<S>>>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<S: ChainStore + Send + 'static> Node<S> {
    /// Spawns the receiver, the per-kind gossip handlers and the miner.
    pub fn spawn(
        engine: ChainEngine<S>,
        inbox: NodeInbox,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let latch = Arc::new(Mutex::new(engine));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let NodeInbox {
            block_in,
            funds_in,
            acc_in,
            config_in,
            stake_in,
            agg_in,
            iot_in,
        } = inbox;

        threads.push(spawn_receiver(
            latch.clone(),
            shutdown.clone(),
            block_in,
            metrics.clone(),
        ));

        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), funds_in, Transaction::Funds));
        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), acc_in, Transaction::Acc));
        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), config_in, Transaction::Config));
        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), stake_in, Transaction::Stake));
        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), agg_in, Transaction::Agg));
        threads.push(spawn_tx_handler(latch.clone(), shutdown.clone(), iot_in, Transaction::Iot));

        threads.push(spawn_miner(latch.clone(), shutdown.clone(), metrics));

        Node {
            latch,
            shutdown,
            threads,
        }
    }

    /// The block-validation latch, for tooling and tests.
    pub fn latch(&self) -> Arc<Mutex<ChainEngine<S>>> {
        self.latch.clone()
    }

    /// Signals every loop to drain at its next suspension point and
    /// waits for them to finish.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Validates incoming peer blocks under the latch.
fn spawn_receiver<S: ChainStore + Send + 'static>(
    latch: Arc<Mutex<ChainEngine<S>>>,
    shutdown: Arc<AtomicBool>,
    block_in: Receiver<Vec<u8>>,
    metrics: Arc<MetricsRegistry>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            let encoded = match block_in.recv_timeout(POLL_INTERVAL) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let Some(block) = Block::decode(&encoded) else {
                tracing::debug!("dropping undecodable block gossip");
                continue;
            };

            let mut engine = latch.lock().expect("latch poisoned");
            let hash = block.hash;
            let old_head = engine.last_block().hash;
            // Staged in open-block storage so the resolver can see
            // in-flight blocks during a concurrent sync.
            engine.store_mut().write_open_block(block.clone());
            let started = Instant::now();
            match engine.validate(block, true) {
                Ok(()) => {
                    let head = engine.last_block();
                    if head.prev_hash != old_head {
                        metrics.consensus.reorgs_total.inc();
                    }
                    metrics.consensus.chain_height.set(head.height as i64);
                }
                Err(e @ ChainError::Critical(_)) => {
                    tracing::error!(error = %e, "validation halted the node");
                }
                Err(e) => {
                    metrics.consensus.blocks_rejected_total.inc();
                    tracing::debug!(hash = %hash.short_hex(), error = %e, "peer block rejected");
                }
            }
            metrics
                .consensus
                .block_validation_seconds
                .observe(started.elapsed().as_secs_f64());
            engine.store_mut().delete_open_block(&hash);
        }
    })
}

/// Drains one typed gossip channel into the open pool.
fn spawn_tx_handler<S, T, F>(
    latch: Arc<Mutex<ChainEngine<S>>>,
    shutdown: Arc<AtomicBool>,
    rx: Receiver<T>,
    wrap: F,
) -> JoinHandle<()>
where
    S: ChainStore + Send + 'static,
    T: Send + 'static,
    F: Fn(T) -> Transaction + Send + 'static,
{
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            let payload = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(p) => p,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let tx = wrap(payload);

            let mut engine = latch.lock().expect("latch poisoned");
            match engine.accept_gossip_tx(tx) {
                Ok(hash) => tracing::debug!(hash = %hash.short_hex(), "transaction pooled"),
                Err(e) => tracing::debug!(error = %e, "transaction gossip rejected"),
            }
        }
    })
}

/// Produces candidate blocks: assembly and head swaps under the latch,
/// the lottery grind outside it.
fn spawn_miner<S: ChainStore + Send + 'static>(
    latch: Arc<Mutex<ChainEngine<S>>>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<MetricsRegistry>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            // Critical section: drain the mempool and link the candidate
            // to the freshest head.
            let prepared = {
                let mut engine = latch.lock().expect("latch poisoned");
                if engine.is_halted() {
                    break;
                }
                match engine.next_candidate() {
                    Ok((block, ctx)) => Some((block, ctx, engine.keys.commitment.clone())),
                    Err(e) => {
                        tracing::warn!(error = %e, "candidate assembly failed");
                        None
                    }
                }
            };
            let Some((mut candidate, ctx, commitment)) = prepared else {
                thread::sleep(LOSING_ROUND_BACKOFF);
                continue;
            };

            // The grind holds no locks; the receiver may swap the head
            // underneath us, in which case validation below rejects the
            // stale candidate and the next round rebuilds it.
            match finalize_block(&mut candidate, &ctx, &commitment, current_unix_timestamp()) {
                Ok(()) => {
                    let mut engine = latch.lock().expect("latch poisoned");
                    let started = Instant::now();
                    match engine.validate(candidate.clone(), true) {
                        Ok(()) => {
                            metrics
                                .consensus
                                .block_validation_seconds
                                .observe(started.elapsed().as_secs_f64());
                            metrics.consensus.blocks_mined_total.inc();
                            metrics.consensus.chain_height.set(candidate.height as i64);
                            // Only broadcast blocks that validated.
                            engine.net().broadcast_block(candidate.encode());
                            tracing::info!(
                                height = candidate.height,
                                hash = %candidate.hash.short_hex(),
                                "block mined"
                            );
                        }
                        Err(e) => {
                            tracing::debug!(
                                hash = %candidate.hash.short_hex(),
                                error = %e,
                                "mined block could not be validated"
                            );
                        }
                    }
                }
                Err(_) => {
                    // Lost this round; let the window move forward.
                    thread::sleep(LOSING_ROUND_BACKOFF);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;
    use crate::consensus::ValidatorKeys;
    use crate::storage::{ChainStore, InMemoryChainStore};
    use crate::types::{Account, Address, FundsTx};
    use ed25519_dalek::SigningKey;

    fn test_config() -> crate::config::ConsensusConfig {
        crate::config::ConsensusConfig {
            initial_difficulty: 0,
            accepted_time_diff: 3_600,
            block_fetch_timeout: Duration::from_millis(100),
            tx_fetch_timeout: Duration::from_millis(100),
            staking_minimum: 100,
            ..Default::default()
        }
    }

    #[test]
    fn gossip_transaction_lands_in_the_open_pool() {
        let (net, inbox, transport) = bus::channels();
        let mut engine = ChainEngine::init(
            test_config(),
            InMemoryChainStore::new(),
            ValidatorKeys::single_validator(),
            net,
        )
        .expect("engine init");

        let key = SigningKey::from_bytes(&[11u8; 32]);
        let mut sender = Account::new(Address::from_verifying_key(&key.verifying_key()));
        sender.balance = 1_000;
        let receiver = Account::new(Address::from_pubkey_bytes(&[12u8; 32]));
        let (from, to) = (sender.id(), receiver.id());
        engine.store_mut().put_account(sender);
        engine.store_mut().put_account(receiver);

        let mut tx = crate::types::Transaction::Funds(FundsTx::new(10, 1, 0, from, to));
        tx.sign(&key);
        let hash = tx.hash();
        let inner = match tx {
            crate::types::Transaction::Funds(f) => f,
            _ => unreachable!(),
        };

        let metrics = Arc::new(MetricsRegistry::new().expect("metrics"));
        let node = Node::spawn(engine, inbox, metrics);
        transport.funds_in.send(inner).expect("gossip tx");

        let latch = node.latch();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut pooled = false;
        while Instant::now() < deadline {
            {
                let engine = latch.lock().expect("latch");
                if engine.store().read_closed_tx(&hash).is_some()
                    || engine.store().read_open_tx(&hash).is_some()
                {
                    pooled = true;
                }
            }
            if pooled {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        node.shutdown();
        assert!(pooled, "gossiped transaction never reached the pool");
    }

    #[test]
    fn miner_extends_the_chain_and_broadcasts() {
        let (net, inbox, transport) = bus::channels();
        let engine = ChainEngine::init(
            test_config(),
            InMemoryChainStore::new(),
            ValidatorKeys::single_validator(),
            net,
        )
        .expect("engine init");

        let metrics = Arc::new(MetricsRegistry::new().expect("metrics"));
        let node = Node::spawn(engine, inbox, metrics.clone());

        let latch = node.latch();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut height = 0;
        while Instant::now() < deadline {
            {
                let engine = latch.lock().expect("latch");
                height = engine.last_block().height;
            }
            if height >= 1 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        node.shutdown();

        assert!(height >= 1, "miner never produced a block");
        assert!(metrics.consensus.blocks_mined_total.get() >= 1);
        let broadcast = transport
            .block_out
            .recv_timeout(Duration::from_secs(1))
            .expect("mined block broadcast");
        assert_eq!(broadcast[0], crate::bus::MsgKind::BlockBrdcst as u8);
    }
}
