/*!
Compression subsystem for checkpoint payloads.

The [`Compressor`] wraps the byte codecs in [`codec`] with the policy the
checkpoint manager relies on:

- payloads under `min_size` are stored raw
- `auto` picks a codec per payload from a sampled entropy estimate
- codec work runs on the blocking pool under `max_compression_time`; a
  failed or late compression falls back to raw bytes instead of failing
- large deflate payloads are split into chunks and compressed in parallel
- running statistics are kept behind a read-write lock
*/

pub mod codec;
pub mod entropy;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use codec::{CompressionAdapter, GzipCompressor, LzwCompressor, NoCompression};

use crate::config::CompressionConfig;
use crate::{CheckpointError, Result};

/// Smoothing factor for the latency moving average
const LATENCY_SMOOTHING: f64 = 0.1;

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Raw bytes
    None,
    /// DEFLATE in gzip framing
    Gzip,
    /// LZW dictionary coding
    Lzw,
    /// Choose per payload from its entropy
    #[default]
    Auto,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lzw => "lzw",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" | "deflate" => Ok(Self::Gzip),
            "lzw" => Ok(Self::Lzw),
            "auto" => Ok(Self::Auto),
            other => Err(CheckpointError::config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

/// Serde helpers for byte buffers as base64 strings
pub(crate) mod serde_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Serde helpers for `Duration` as integer nanoseconds
mod serde_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

/// Output of a compression call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedData {
    #[serde(with = "serde_base64")]
    pub data: Vec<u8>,
    /// Concrete algorithm applied; never `auto`
    pub compression_type: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed / original; 1.0 when stored raw
    pub compression_ratio: f64,
    #[serde(with = "serde_nanos", default)]
    pub compression_time: Duration,
}

impl CompressedData {
    /// Wrap bytes without compressing them
    pub fn raw(data: Vec<u8>, elapsed: Duration) -> Self {
        let size = data.len();
        Self {
            data,
            compression_type: CompressionAlgorithm::None,
            original_size: size,
            compressed_size: size,
            compression_ratio: 1.0,
            compression_time: elapsed,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_type != CompressionAlgorithm::None
    }
}

/// Snapshot of compressor statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub total_operations: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Exponentially weighted moving average of compression latency
    pub average_latency: Duration,
}

impl CompressionStats {
    /// Aggregate compressed / original ratio; 1.0 before any operation
    pub fn compression_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            1.0
        } else {
            self.total_compressed_bytes as f64 / self.total_original_bytes as f64
        }
    }

    fn record(&mut self, original: usize, compressed: usize, elapsed: Duration) {
        self.average_latency = if self.total_operations == 0 {
            elapsed
        } else {
            let avg = self.average_latency.as_secs_f64();
            Duration::from_secs_f64(
                LATENCY_SMOOTHING * elapsed.as_secs_f64() + (1.0 - LATENCY_SMOOTHING) * avg,
            )
        };
        self.total_operations += 1;
        self.total_original_bytes += original as u64;
        self.total_compressed_bytes += compressed as u64;
    }
}

/// Policy-driven, context-bounded compressor
#[derive(Debug)]
pub struct Compressor {
    config: CompressionConfig,
    stats: RwLock<CompressionStats>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: RwLock::new(CompressionStats::default()),
        })
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// The algorithm that would be applied to `data`, after the size and
    /// `auto` rules
    pub fn select_algorithm(&self, data: &[u8]) -> CompressionAlgorithm {
        if data.len() < self.config.min_size {
            return CompressionAlgorithm::None;
        }
        match self.config.algorithm {
            CompressionAlgorithm::Auto => entropy::select_algorithm(data),
            other => other,
        }
    }

    /// Compress `data` under the configured time budget
    ///
    /// Codec failures and deadline overruns are logged and answered with the
    /// raw bytes, so this only fails if the blocking pool itself is gone.
    pub async fn compress(&self, data: &[u8]) -> Result<CompressedData> {
        let start = Instant::now();
        let algorithm = self.select_algorithm(data);

        if algorithm == CompressionAlgorithm::None {
            let result = CompressedData::raw(data.to_vec(), start.elapsed());
            self.record(&result);
            return Ok(result);
        }

        let input = Arc::new(data.to_vec());
        let cancel = Arc::new(AtomicBool::new(false));
        let parallel = algorithm == CompressionAlgorithm::Gzip
            && self.config.parallel
            && data.len() > self.config.parallel_threshold;
        let level = self.config.level;

        let task = {
            let input = Arc::clone(&input);
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || {
                run_compress(algorithm, level, &input, parallel, &cancel)
            })
        };

        let outcome = match tokio::time::timeout(self.config.max_compression_time, task).await {
            Ok(joined) => joined.map_err(CheckpointError::from).and_then(|r| r),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                Err(CheckpointError::Timeout(format!(
                    "compression exceeded {:?}",
                    self.config.max_compression_time
                )))
            }
        };

        let result = match outcome {
            Ok(compressed) => {
                let elapsed = start.elapsed();
                let original_size = input.len();
                let compressed_size = compressed.len();
                debug!(
                    algorithm = %algorithm,
                    original_size,
                    compressed_size,
                    parallel,
                    "Compressed payload"
                );
                CompressedData {
                    data: compressed,
                    compression_type: algorithm,
                    original_size,
                    compressed_size,
                    compression_ratio: compressed_size as f64 / original_size.max(1) as f64,
                    compression_time: elapsed,
                }
            }
            Err(e) => {
                warn!(
                    algorithm = %algorithm,
                    size = input.len(),
                    error = %e,
                    "Compression failed, storing uncompressed"
                );
                let raw = Arc::try_unwrap(input).unwrap_or_else(|shared| shared.as_ref().clone());
                CompressedData::raw(raw, start.elapsed())
            }
        };

        self.record(&result);
        Ok(result)
    }

    /// Recover the original bytes of a [`CompressedData`]
    ///
    /// Not bounded by `max_compression_time`: data written under a looser
    /// budget must stay readable. Callers bound it by dropping the future.
    pub async fn decompress(&self, compressed: &CompressedData) -> Result<Vec<u8>> {
        let algorithm = compressed.compression_type;
        match algorithm {
            CompressionAlgorithm::None => return Ok(compressed.data.clone()),
            CompressionAlgorithm::Auto => {
                return Err(CheckpointError::corrupted(
                    "compressed data does not record a concrete algorithm",
                ))
            }
            CompressionAlgorithm::Gzip | CompressionAlgorithm::Lzw => {}
        }

        let input = compressed.data.clone();
        let task = tokio::task::spawn_blocking(move || adapter_for(algorithm, 6).decompress(&input));

        let output = task
            .await?
            .map_err(|e| CheckpointError::corrupted(format!("{algorithm} payload: {e}")))?;

        if output.len() != compressed.original_size {
            return Err(CheckpointError::corrupted(format!(
                "decompressed {} bytes, expected {}",
                output.len(),
                compressed.original_size
            )));
        }
        Ok(output)
    }

    pub fn stats(&self) -> CompressionStats {
        match self.stats.read() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset_stats(&self) {
        let mut stats = match self.stats.write() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        *stats = CompressionStats::default();
    }

    fn record(&self, result: &CompressedData) {
        let mut stats = match self.stats.write() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.record(
            result.original_size,
            result.compressed_size,
            result.compression_time,
        );
    }
}

fn adapter_for(algorithm: CompressionAlgorithm, level: u32) -> Box<dyn CompressionAdapter> {
    match algorithm {
        CompressionAlgorithm::Gzip => Box::new(GzipCompressor::with_level(level)),
        CompressionAlgorithm::Lzw => Box::new(LzwCompressor::new()),
        CompressionAlgorithm::None | CompressionAlgorithm::Auto => Box::new(NoCompression::new()),
    }
}

fn run_compress(
    algorithm: CompressionAlgorithm,
    level: u32,
    data: &[u8],
    parallel: bool,
    cancel: &AtomicBool,
) -> Result<Vec<u8>> {
    if parallel {
        let workers = num_cpus::get().max(1);
        let chunk_size = data.len().div_ceil(workers);
        return GzipCompressor::with_level(level).compress_chunked(data, chunk_size, cancel);
    }
    adapter_for(algorithm, level).compress(data)
}
