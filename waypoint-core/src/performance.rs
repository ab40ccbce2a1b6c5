//! Latency and success tracking for checkpoint saves and loads

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::observability::CheckpointMetrics;

/// Counters for one kind of operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub failures: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
    pub last_latency: Duration,
}

impl OperationStats {
    /// Mean latency over every recorded call
    pub fn average_latency(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        match u32::try_from(self.count) {
            Ok(count) => self.total_latency / count,
            Err(_) => Duration::from_secs_f64(self.total_latency.as_secs_f64() / self.count as f64),
        }
    }

    /// Fraction of calls that succeeded; 1.0 before any call
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        (self.count - self.failures) as f64 / self.count as f64
    }

    fn record(&mut self, latency: Duration, success: bool) {
        self.count += 1;
        if !success {
            self.failures += 1;
        }
        self.total_latency += latency;
        self.max_latency = self.max_latency.max(latency);
        self.last_latency = latency;
    }
}

/// Snapshot of everything the [`PerformanceManager`] tracks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub save: OperationStats,
    pub load: OperationStats,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Sum of stored sizes of successful saves
    pub bytes_saved: u64,
}

impl PerformanceStats {
    /// Hits over lookups; 0.0 before any lookup
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Records per-operation latency and outcome
///
/// The manager records saves and loads itself. Callers that put a cache in
/// front of `load` report hits and misses through
/// [`record_cache_hit`](Self::record_cache_hit) and
/// [`record_cache_miss`](Self::record_cache_miss).
#[derive(Debug, Default)]
pub struct PerformanceManager {
    stats: RwLock<PerformanceStats>,
    #[cfg(feature = "metrics")]
    metrics: Option<CheckpointMetrics>,
}

impl PerformanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also export every observation to `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(metrics: CheckpointMetrics) -> Self {
        Self {
            stats: RwLock::default(),
            metrics: Some(metrics),
        }
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&CheckpointMetrics> {
        self.metrics.as_ref()
    }

    pub fn record_save(&self, latency: Duration, stored_bytes: Option<u64>) {
        let success = stored_bytes.is_some();
        {
            let mut stats = self.write();
            stats.save.record(latency, success);
            stats.bytes_saved += stored_bytes.unwrap_or(0);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.saves_total.inc();
            metrics.save_latency_seconds.observe(latency.as_secs_f64());
            match stored_bytes {
                Some(bytes) => metrics.checkpoint_size_bytes.observe(bytes as f64),
                None => metrics.save_errors_total.inc(),
            }
        }
    }

    pub fn record_load(&self, latency: Duration, success: bool) {
        self.write().load.record(latency, success);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.loads_total.inc();
            metrics.load_latency_seconds.observe(latency.as_secs_f64());
            if !success {
                metrics.load_errors_total.inc();
            }
        }
    }

    pub fn record_cache_hit(&self) {
        self.write().cache_hits += 1;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.cache_hits_total.inc();
        }
    }

    pub fn record_cache_miss(&self) {
        self.write().cache_misses += 1;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses_total.inc();
        }
    }

    pub fn stats(&self) -> PerformanceStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.write() = PerformanceStats::default();
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PerformanceStats> {
        self.stats.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_and_success_rate() {
        let perf = PerformanceManager::new();
        perf.record_save(Duration::from_millis(10), Some(100));
        perf.record_save(Duration::from_millis(30), Some(300));
        perf.record_save(Duration::from_millis(20), None);

        let stats = perf.stats();
        assert_eq!(stats.save.count, 3);
        assert_eq!(stats.save.failures, 1);
        assert_eq!(stats.save.average_latency(), Duration::from_millis(20));
        assert_eq!(stats.save.max_latency, Duration::from_millis(30));
        assert_eq!(stats.save.last_latency, Duration::from_millis(20));
        assert!((stats.save.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.bytes_saved, 400);
    }

    #[test]
    fn test_empty_stats() {
        let stats = PerformanceManager::new().stats();
        assert_eq!(stats.load.average_latency(), Duration::ZERO);
        assert_eq!(stats.load.success_rate(), 1.0);
        assert_eq!(stats.cache_hit_ratio(), 0.0);
    }

    #[test]
    fn test_cache_counters_and_reset() {
        let perf = PerformanceManager::new();
        perf.record_cache_hit();
        perf.record_cache_hit();
        perf.record_cache_hit();
        perf.record_cache_miss();
        assert!((perf.stats().cache_hit_ratio() - 0.75).abs() < 1e-9);

        perf.record_load(Duration::from_millis(5), false);
        perf.reset();
        assert_eq!(perf.stats(), PerformanceStats::default());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_export() {
        let perf = PerformanceManager::with_metrics(CheckpointMetrics::new().unwrap());
        perf.record_save(Duration::from_millis(1), Some(2048));
        perf.record_load(Duration::from_millis(1), false);

        let metrics = perf.metrics().unwrap();
        assert_eq!(metrics.saves_total.get(), 1.0);
        assert_eq!(metrics.load_errors_total.get(), 1.0);
    }
}
