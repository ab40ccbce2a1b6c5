/*!
Persisted checkpoint envelope and the encode/decode protocol.

Write path:
1. The checkpoint is encoded as JSON.
2. With compression enabled, those bytes go through the [`Compressor`] and
   the result is wrapped in a [`StoredEnvelope`], which is what gets stored.
   With compression disabled the checkpoint JSON is stored as is.

Read path:
1. The stored bytes are decoded as an envelope. If that works and
   `is_compressed` is set, the payload is decompressed; if the envelope
   carries raw `data`, that is the payload.
2. Otherwise the stored bytes themselves are the checkpoint JSON. This keeps
   records written before compression, or by a manager configured without
   it, readable.
3. A missing or zero version reads back as version 1.
*/

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, LEGACY_FORMAT_VERSION};
use crate::compression::{serde_base64, CompressedData, Compressor};
use crate::{CheckpointError, Result};

/// Wrapper distinguishing compressed from raw stored bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredEnvelope {
    #[serde(default)]
    pub is_compressed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressedData>,

    /// Uncompressed checkpoint bytes when compression was skipped
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_base64::option"
    )]
    pub data: Option<Vec<u8>>,

    /// SHA-256 of the checkpoint encoding, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StoredEnvelope {
    fn carries_payload(&self) -> bool {
        self.is_compressed || self.data.is_some()
    }
}

/// Compute SHA-256 hash of the provided data as lowercase hex
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Encodes and decodes checkpoints for storage
#[derive(Debug, Clone)]
pub struct CheckpointCodec {
    compressor: Arc<Compressor>,
    compress_on_write: bool,
}

impl CheckpointCodec {
    /// `compressor` is always used for reads; `compress_on_write` controls
    /// whether new records are wrapped and compressed
    pub fn new(compressor: Arc<Compressor>, compress_on_write: bool) -> Self {
        Self {
            compressor,
            compress_on_write,
        }
    }

    pub fn compressor(&self) -> &Arc<Compressor> {
        &self.compressor
    }

    pub fn compresses(&self) -> bool {
        self.compress_on_write
    }

    /// Produce the bytes stored for `checkpoint`
    pub async fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let encoded = serde_json::to_vec(checkpoint)?;
        if !self.compress_on_write {
            return Ok(encoded);
        }

        let checksum = Some(compute_hash(&encoded));
        let envelope = match self.compressor.compress(&encoded).await {
            Ok(compressed) if compressed.is_compressed() => StoredEnvelope {
                is_compressed: true,
                compression: Some(compressed),
                data: None,
                checksum,
            },
            Ok(raw) => StoredEnvelope {
                is_compressed: false,
                compression: None,
                data: Some(raw.data),
                checksum,
            },
            Err(e) => {
                tracing::warn!(
                    workflow_id = %checkpoint.workflow_id,
                    error = %e,
                    "Compression unavailable, storing checkpoint uncompressed"
                );
                StoredEnvelope {
                    is_compressed: false,
                    compression: None,
                    data: Some(encoded),
                    checksum,
                }
            }
        };

        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Recover a checkpoint from stored bytes
    ///
    /// Any decode failure is reported as [`CheckpointError::Corrupted`] (or
    /// an integrity failure when a checksum does not match).
    pub async fn decode(&self, stored: &[u8]) -> Result<Checkpoint> {
        let payload: Cow<'_, [u8]> = match serde_json::from_slice::<StoredEnvelope>(stored) {
            Ok(envelope) if envelope.carries_payload() => {
                Cow::Owned(self.open_envelope(envelope).await?)
            }
            _ => Cow::Borrowed(stored),
        };

        let mut checkpoint: Checkpoint = serde_json::from_slice(&payload)
            .map_err(|e| CheckpointError::corrupted(format!("invalid checkpoint encoding: {e}")))?;
        if checkpoint.version == 0 {
            checkpoint.version = LEGACY_FORMAT_VERSION;
        }
        Ok(checkpoint)
    }

    async fn open_envelope(&self, envelope: StoredEnvelope) -> Result<Vec<u8>> {
        let payload = if envelope.is_compressed {
            let compressed = envelope.compression.ok_or_else(|| {
                CheckpointError::corrupted("envelope marked compressed but has no payload")
            })?;
            self.compressor.decompress(&compressed).await?
        } else {
            envelope.data.unwrap_or_default()
        };

        if let Some(expected) = envelope.checksum {
            let actual = compute_hash(&payload);
            if actual != expected {
                return Err(CheckpointError::IntegrityCheckFailed { expected, actual });
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionAlgorithm;
    use crate::config::CompressionConfig;
    use serde_json::json;

    fn codec(compress: bool, algorithm: CompressionAlgorithm) -> CheckpointCodec {
        let compressor = Compressor::new(CompressionConfig {
            algorithm,
            min_size: 64,
            ..CompressionConfig::default()
        })
        .unwrap();
        CheckpointCodec::new(Arc::new(compressor), compress)
    }

    fn sample_checkpoint() -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            "w1",
            "summarize",
            json!({"messages": vec!["a fairly repetitive message"; 40]}),
        )
        .with_completed_nodes(["plan", "search"]);
        checkpoint.assign_defaults();
        checkpoint
    }

    #[tokio::test]
    async fn test_roundtrip_compressed() {
        let codec = codec(true, CompressionAlgorithm::Gzip);
        let checkpoint = sample_checkpoint();

        let stored = codec.encode(&checkpoint).await.unwrap();
        let envelope: StoredEnvelope = serde_json::from_slice(&stored).unwrap();
        assert!(envelope.is_compressed);
        assert!(envelope.checksum.is_some());

        assert_eq!(codec.decode(&stored).await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn test_roundtrip_uncompressed_is_plain_json() {
        let codec = codec(false, CompressionAlgorithm::Gzip);
        let checkpoint = sample_checkpoint();

        let stored = codec.encode(&checkpoint).await.unwrap();
        let plain: Checkpoint = serde_json::from_slice(&stored).unwrap();
        assert_eq!(plain, checkpoint);
        assert_eq!(codec.decode(&stored).await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn test_small_payload_uses_raw_data_field() {
        let codec = codec(true, CompressionAlgorithm::Gzip);
        let mut checkpoint = Checkpoint::new("w", "n", json!(1));
        checkpoint.assign_defaults();
        let compressor = Compressor::new(CompressionConfig {
            min_size: usize::MAX,
            ..CompressionConfig::default()
        })
        .unwrap();
        let codec_big_threshold = CheckpointCodec::new(Arc::new(compressor), true);

        let stored = codec_big_threshold.encode(&checkpoint).await.unwrap();
        let envelope: StoredEnvelope = serde_json::from_slice(&stored).unwrap();
        assert!(!envelope.is_compressed);
        assert!(envelope.data.is_some());

        // A differently configured reader still decodes it
        assert_eq!(codec.decode(&stored).await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn test_reader_without_compression_reads_compressed_records() {
        let writer = codec(true, CompressionAlgorithm::Lzw);
        let reader = codec(false, CompressionAlgorithm::None);
        let checkpoint = sample_checkpoint();

        let stored = writer.encode(&checkpoint).await.unwrap();
        assert_eq!(reader.decode(&stored).await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn test_legacy_record_without_version() {
        let codec = codec(true, CompressionAlgorithm::Auto);
        let legacy = br#"{"id":"old","workflow_id":"w1","timestamp":"2023-01-01T00:00:00Z","current_node":"n","context":{"x":1}}"#;

        let checkpoint = codec.decode(legacy).await.unwrap();
        assert_eq!(checkpoint.id, "old");
        assert_eq!(checkpoint.version, LEGACY_FORMAT_VERSION);
    }

    #[tokio::test]
    async fn test_garbage_is_corrupted() {
        let codec = codec(true, CompressionAlgorithm::Gzip);
        let err = codec.decode(b"\x00\x01not json").await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_detected() {
        let codec = codec(true, CompressionAlgorithm::Gzip);
        let checkpoint = sample_checkpoint();
        let stored = codec.encode(&checkpoint).await.unwrap();

        let mut envelope: StoredEnvelope = serde_json::from_slice(&stored).unwrap();
        envelope.checksum = Some(compute_hash(b"something else"));
        let tampered = serde_json::to_vec(&envelope).unwrap();

        let err = codec.decode(&tampered).await.unwrap_err();
        assert!(matches!(err, CheckpointError::IntegrityCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_compressed_flag_without_payload_is_corrupted() {
        let codec = codec(true, CompressionAlgorithm::Gzip);
        let stored = br#"{"is_compressed":true}"#;
        let err = codec.decode(stored).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted(_)));
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
