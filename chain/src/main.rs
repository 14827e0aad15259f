// src/main.rs
//
// Node binary that wires up the chain library:
//
// - RocksDB-backed storage
// - PoS consensus engine with longest-chain resolution
// - miner + receiver loops behind the block-validation latch
// - Prometheus metrics exporter on /metrics

use std::sync::Arc;

use chain::{
    ChainEngine, MetricsRegistry, Node, NodeConfig, RocksDbChainStore, ValidatorKeys, bus,
    run_prometheus_http_server,
};

#[tokio::main]
async fn main() {
    // Basic tracing setup.
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "chain=info".to_string()))
        .init();

    if let Err(err) = run_node().await {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run_node() -> Result<(), String> {
    // For now, just use defaults. Later this can load from a file/CLI/env.
    let cfg = NodeConfig::default();

    // ---------------------------
    // Metrics registry + exporter
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::error!(error = %e, "metrics HTTP server error");
            }
        });
        tracing::info!("metrics exporter listening on http://{addr}/metrics");
    }

    // ---------------------------
    // Storage backend (RocksDB)
    // ---------------------------

    let store = RocksDbChainStore::open(&cfg.storage)
        .map_err(|e| format!("failed to open RocksDB store at {}: {e}", cfg.storage.path))?;

    // ---------------------------
    // Validator identity
    // ---------------------------

    // A fresh deployment generates its own identity. The root account is
    // the validator, so a solo node can produce from genesis onward.
    let keys = ValidatorKeys::single_validator();
    tracing::info!(
        validator = %hex::encode(keys.validator_id().as_hash().as_bytes()),
        "validator identity"
    );

    // ---------------------------
    // Bus + consensus engine
    // ---------------------------

    let (net, inbox, transport) = bus::channels();

    let engine = ChainEngine::init(cfg.consensus.clone(), store, keys, net)
        .map_err(|e| format!("failed to initialise chain engine: {e}"))?;

    let node = Node::spawn(engine, inbox, metrics);
    tracing::info!(
        block_interval = cfg.consensus.block_interval,
        "node running; press ctrl-c to stop"
    );

    // ---------------------------
    // Shutdown
    // ---------------------------

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {e}"))?;
    tracing::info!("shutting down");
    node.shutdown();

    // The transport handle stays alive until here so the bus channels
    // never disconnect under the engine. Peer wiring attaches to it in a
    // networked deployment.
    drop(transport);
    Ok(())
}
