//! Chain library crate.
//!
//! This crate provides the core consensus and chain-management engine of
//! a proof-of-stake node for aggregating IoT-originated transactions:
//!
//! - strongly-typed domain types (`types`),
//! - the consensus core: assembly, finalization, validation with
//!   mirrored rollback, longest-chain resolution, difficulty
//!   retargeting and slashing (`consensus`),
//! - typed storage backends (`storage`),
//! - the typed message bus towards the transport layer (`bus`),
//! - Prometheus-based metrics (`metrics`),
//! - the miner/receiver orchestration (`node`),
//! - and a top-level node configuration (`config`).
//!
//! Higher-level binaries compose these pieces into validator nodes,
//! simulators, and experiment harnesses.

pub mod bus;
pub mod config;
pub mod consensus;
pub mod metrics;
pub mod node;
pub mod storage;
pub mod types;

// Re-export top-level configuration types.
pub use config::{ConsensusConfig, MetricsConfig, NodeConfig};

// Re-export "core" consensus types and operations.
pub use consensus::{
    BlockData, ChainEngine, ChainError, DifficultyRetargeter, ParameterRegistry, Parameters,
    PosContext, SlashingProof, ValidationError, ValidatorKeys, finalize_block, new_block,
    pos_hash, satisfies_target,
};

// Re-export storage backends.
pub use storage::{ChainStore, InMemoryChainStore, RocksDbChainStore, RocksDbConfig, StorageError};

// Re-export metrics registry and consensus metrics.
pub use metrics::{ConsensusMetrics, MetricsRegistry, run_prometheus_http_server};

// Re-export the orchestrator.
pub use node::Node;

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Type alias for the default chain store backend.
pub type DefaultChainStore = RocksDbChainStore;

/// Type alias for the default engine stack used by a "typical" node.
///
/// This runs the consensus core over RocksDB-backed storage.
pub type DefaultChainEngine = ChainEngine<DefaultChainStore>;
