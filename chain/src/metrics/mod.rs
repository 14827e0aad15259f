//! Metrics for the chain node.
//!
//! This module provides a Prometheus-backed [`MetricsRegistry`] with
//! strongly-typed consensus metrics and an async HTTP exporter serving
//! the text exposition format on `/metrics`.

mod prometheus;

pub use prometheus::{ConsensusMetrics, MetricsRegistry, run_prometheus_http_server};
