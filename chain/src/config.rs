//! Top-level configuration for a chain node.
//!
//! This module aggregates configuration for:
//!
//! - consensus parameters effective from genesis (`ConsensusConfig`),
//! - storage (RocksDB path and creation flags),
//! - metrics exporter (enable flag + listen address).
//!
//! The goal is to have a single `NodeConfig` struct that higher-level
//! binaries (e.g. `main.rs`) can construct from defaults, config files,
//! or environment variables as needed.

use std::net::SocketAddr;
use std::time::Duration;

use crate::storage::RocksDbConfig;

/// Consensus parameters effective from genesis.
///
/// Everything except the two fetch timeouts and the initial difficulty
/// is individually mutable at runtime through a ConfigTx; the values
/// here are the deployment defaults the parameter registry starts from.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Minimum fee a transaction must pay to be included.
    pub fee_minimum: u64,
    /// Soft limit on the serialized block size, in bytes.
    pub block_size: u64,
    /// Number of blocks per difficulty-retarget window.
    pub diff_interval: u64,
    /// Intended seconds per block.
    pub block_interval: u64,
    /// Reward for delivering a correct PoS block.
    pub block_reward: u64,
    /// Minimum balance a validator must own to start staking.
    pub staking_minimum: u64,
    /// Blocks a new validator must wait before producing.
    pub waiting_minimum: u64,
    /// Seconds a block timestamp may lie in the future.
    pub accepted_time_diff: u64,
    /// Height range within which equivocation is slashable.
    pub slashing_window_size: u64,
    /// Reward for claiming a correct slashing proof.
    pub slash_reward: u64,
    /// Number of previous commitment proofs mixed into the PoS hash.
    pub num_included_prev_proofs: usize,
    /// Difficulty the target history starts from.
    pub initial_difficulty: u8,
    /// How long the resolver waits for a requested ancestor block.
    pub block_fetch_timeout: Duration,
    /// How long pre-validation waits for a requested transaction.
    pub tx_fetch_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            fee_minimum: 1,
            block_size: 5_000,
            diff_interval: 10,
            block_interval: 15,
            block_reward: 5,
            staking_minimum: 1_000,
            waiting_minimum: 0,
            accepted_time_diff: 60,
            slashing_window_size: 100,
            slash_reward: 2,
            num_included_prev_proofs: 5,
            initial_difficulty: 8,
            block_fetch_timeout: Duration::from_secs(20),
            tx_fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a chain node.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub storage: RocksDbConfig,
    pub metrics: MetricsConfig,
}
