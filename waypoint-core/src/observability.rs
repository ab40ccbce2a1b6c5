/*!
Observability infrastructure for the Waypoint engine.

This module provides:
- Structured logging setup (`tracing` with an env-filter, plain or JSON output)
- Prometheus metrics instrumentation behind the `metrics` feature

Metrics are owned per [`PerformanceManager`](crate::performance::PerformanceManager)
instance, each with its own registry, so several managers in one process
never collide on metric registration.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{CheckpointError, Result};

const DEFAULT_FILTER: &str = "waypoint_core=info,waypoint_retry=info";

/// Prometheus collectors for checkpoint operations
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct CheckpointMetrics {
    pub saves_total: Counter,
    pub save_errors_total: Counter,
    pub save_latency_seconds: Histogram,
    pub loads_total: Counter,
    pub load_errors_total: Counter,
    pub load_latency_seconds: Histogram,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub checkpoint_size_bytes: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl CheckpointMetrics {
    /// Create and register a fresh set of collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| {
                CheckpointError::config(format!("Failed to create {name} metric: {e}"))
            })?;
            registry.register(Box::new(counter.clone())).map_err(|e| {
                CheckpointError::config(format!("Failed to register {name}: {e}"))
            })?;
            Ok(counter)
        };
        let histogram = |name: &str, help: &str, buckets: Vec<f64>| -> Result<Histogram> {
            let histogram =
                Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).map_err(
                    |e| CheckpointError::config(format!("Failed to create {name} metric: {e}")),
                )?;
            registry.register(Box::new(histogram.clone())).map_err(|e| {
                CheckpointError::config(format!("Failed to register {name}: {e}"))
            })?;
            Ok(histogram)
        };

        let latency_buckets = prometheus::exponential_buckets(0.0005, 2.0, 16).map_err(|e| {
            CheckpointError::config(format!("Invalid latency buckets: {e}"))
        })?;
        let size_buckets = prometheus::exponential_buckets(256.0, 4.0, 10)
            .map_err(|e| CheckpointError::config(format!("Invalid size buckets: {e}")))?;

        Ok(Self {
            saves_total: counter("waypoint_saves_total", "Checkpoint saves attempted")?,
            save_errors_total: counter("waypoint_save_errors_total", "Checkpoint saves that failed")?,
            save_latency_seconds: histogram(
                "waypoint_save_latency_seconds",
                "Duration of checkpoint saves in seconds",
                latency_buckets.clone(),
            )?,
            loads_total: counter("waypoint_loads_total", "Checkpoint loads attempted")?,
            load_errors_total: counter("waypoint_load_errors_total", "Checkpoint loads that failed")?,
            load_latency_seconds: histogram(
                "waypoint_load_latency_seconds",
                "Duration of checkpoint loads in seconds",
                latency_buckets,
            )?,
            cache_hits_total: counter("waypoint_cache_hits_total", "Checkpoint cache hits")?,
            cache_misses_total: counter("waypoint_cache_misses_total", "Checkpoint cache misses")?,
            checkpoint_size_bytes: histogram(
                "waypoint_checkpoint_size_bytes",
                "Stored size of saved checkpoints in bytes",
                size_buckets,
            )?,
            registry,
        })
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| CheckpointError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            CheckpointError::storage(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Initialize the global tracing subscriber
///
/// The filter comes from `RUST_LOG` when set, otherwise defaults to `info`
/// for the Waypoint crates. With `json` set, events are emitted as one JSON
/// object per line.
///
/// Fails if a global subscriber is already installed.
pub fn init_observability(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .map_err(|e| CheckpointError::config(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| {
        CheckpointError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!(json, "Waypoint observability initialized");
    Ok(())
}

/// Initialize observability with default settings (JSON output)
pub fn init_default_observability() -> Result<()> {
    init_observability(true)
}
