/*!
Byte codecs behind the compressor.

Each codec implements [`CompressionAdapter`]. The deflate codec writes gzip
members and reads with a multi-member decoder, so independently compressed
chunks can be concatenated and still decode as one stream.
*/

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use rayon::prelude::*;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use weezl::{decode::Decoder as LzwDecoder, encode::Encoder as LzwEncoder, BitOrder};

use crate::{CheckpointError, Result};

/// Smallest chunk handed to a worker during parallel compression
pub const MIN_PARALLEL_CHUNK_SIZE: usize = 64 * 1024;

/// LZW literal width; byte-oriented input
const LZW_LITERAL_WIDTH: u8 = 8;

/// Compression abstraction for checkpoint data
///
/// This trait defines the interface for all compression implementations.
/// It allows the compressor to work with different compression algorithms
/// without being coupled to any specific implementation.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// Uses DEFLATE in gzip framing. Decompression accepts any number of
/// concatenated gzip members.
///
/// # Example
/// ```rust
/// use waypoint_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = b"some workflow state data to compress";
/// let compressed = compressor.compress(data)?;
/// let decompressed = compressor.decompress(&compressed)?;
/// assert_eq!(data, &decompressed[..]);
/// # Ok::<(), waypoint_core::CheckpointError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Compress `data` as independent gzip members, one per chunk, in parallel
    ///
    /// Members are concatenated in input order. `cancel` is checked before
    /// each chunk starts; once set, the call fails with `Cancelled` and no
    /// partial output is returned.
    pub fn compress_chunked(
        &self,
        data: &[u8],
        chunk_size: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>> {
        let chunk_size = chunk_size.max(MIN_PARALLEL_CHUNK_SIZE);
        let members = data
            .par_chunks(chunk_size)
            .map(|chunk| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(CheckpointError::Cancelled(
                        "parallel compression abandoned".to_string(),
                    ));
                }
                self.compress(chunk)
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;

        let total = members.iter().map(Vec::len).sum();
        let mut output = Vec::with_capacity(total);
        for member in members {
            output.extend_from_slice(&member);
        }
        Ok(output)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            CheckpointError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| CheckpointError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = MultiGzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CheckpointError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// LZW dictionary compression adapter
///
/// Least-significant-bit-first code packing with 8-bit literals.
#[derive(Debug, Clone, Default)]
pub struct LzwCompressor;

impl LzwCompressor {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for LzwCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        LzwEncoder::new(BitOrder::Lsb, LZW_LITERAL_WIDTH)
            .encode(data)
            .map_err(|e| CheckpointError::compression(format!("LZW encoding failed: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        LzwDecoder::new(BitOrder::Lsb, LZW_LITERAL_WIDTH)
            .decode(compressed_data)
            .map_err(|e| CheckpointError::compression(format!("LZW decoding failed: {e}")))
    }

    fn algorithm_name(&self) -> &str {
        "lzw"
    }
}

/// Pass-through adapter for incompressible or tiny payloads
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}
