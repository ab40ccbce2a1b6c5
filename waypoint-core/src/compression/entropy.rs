//! Entropy sampling for automatic algorithm selection

use super::CompressionAlgorithm;

/// Bytes inspected from the front of a payload
pub const SAMPLE_SIZE: usize = 1024;

/// Above this many bits per byte the payload is treated as incompressible
pub const INCOMPRESSIBLE_ENTROPY: f64 = 7.5;

/// Above this (and up to [`INCOMPRESSIBLE_ENTROPY`]) the dictionary codec is used
pub const DICTIONARY_ENTROPY: f64 = 6.0;

/// Shannon entropy of `data` in bits per byte (0.0 to 8.0)
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }

    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Pick a codec from the entropy of the payload's first [`SAMPLE_SIZE`] bytes
pub fn select_algorithm(data: &[u8]) -> CompressionAlgorithm {
    let sample = &data[..data.len().min(SAMPLE_SIZE)];
    let entropy = shannon_entropy(sample);

    if entropy > INCOMPRESSIBLE_ENTROPY {
        CompressionAlgorithm::None
    } else if entropy > DICTIONARY_ENTROPY {
        CompressionAlgorithm::Lzw
    } else {
        CompressionAlgorithm::Gzip
    }
}
