//! Reversible compression applied to snapshots before durable storage.
//!
//! Compression is a pure transform: `decompress(compress(x)) == x` for
//! every payload. Caches always hold the uncompressed form; only the
//! durable store sees compressed bytes.

use thiserror::Error;

/// Error from compressing or decompressing snapshot bytes.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// A reversible byte-level transform.
pub trait Compressor: Send + Sync {
    /// Name recorded alongside durable snapshots for debugging.
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`CompressError::Compress`] when the payload cannot be
    /// encoded.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// # Errors
    ///
    /// Returns [`CompressError::Decompress`] when the payload is not a
    /// valid compressed frame.
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError>;
}

/// Zstandard compression.
#[derive(Clone, Copy, Debug)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Fast default (level 1): snapshot payloads are mostly JSON, which
    /// compresses well even at the cheapest level.
    #[must_use]
    pub const fn new() -> Self {
        Self { level: 1 }
    }

    #[must_use]
    pub const fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::encode_all(bytes, self.level).map_err(CompressError::Compress)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::decode_all(bytes).map_err(CompressError::Decompress)
    }
}

/// Identity transform, for deployments where snapshot payloads are tiny.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CompressError> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_round_trips() {
        let compressor = ZstdCompressor::new();
        let payload = br#"{"balance":125,"history":[1,2,3,4,5,6,7,8,9,10]}"#;
        let compressed = compressor.compress(payload).unwrap();
        let restored = compressor.decompress(&compressed).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn zstd_round_trips_empty_and_binary() {
        let compressor = ZstdCompressor::with_level(3);
        for payload in [&b""[..], &[0u8, 255, 1, 254, 2, 253][..]] {
            let compressed = compressor.compress(payload).unwrap();
            assert_eq!(compressor.decompress(&compressed).unwrap(), payload);
        }
    }

    #[test]
    fn zstd_rejects_garbage() {
        let compressor = ZstdCompressor::new();
        let result = compressor.decompress(b"definitely not a zstd frame");
        assert!(matches!(result, Err(CompressError::Decompress(_))));
    }

    #[test]
    fn noop_is_identity() {
        let compressor = NoopCompressor;
        let payload = b"as-is";
        assert_eq!(compressor.compress(payload).unwrap(), payload);
        assert_eq!(compressor.decompress(payload).unwrap(), payload);
    }
}
