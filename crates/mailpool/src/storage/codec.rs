//! Transparent zstd compression for cached payloads

use anyhow::{Context, Result};

/// Payload as it goes into a persistent tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Compresses payloads above a size threshold
///
/// Payloads of at most `threshold` bytes are stored as-is. Larger payloads
/// are zstd-compressed unless compression does not make them smaller.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    threshold: usize,
    level: i32,
}

impl PayloadCodec {
    pub fn new(threshold: usize, level: i32) -> Self {
        Self { threshold, level }
    }

    /// Encode a payload for storage
    pub fn encode(&self, raw: &[u8]) -> Result<EncodedPayload> {
        if raw.len() > self.threshold {
            let compressed =
                zstd::encode_all(raw, self.level).context("Failed to compress payload")?;
            if compressed.len() < raw.len() {
                return Ok(EncodedPayload {
                    bytes: compressed,
                    compressed: true,
                });
            }
        }

        Ok(EncodedPayload {
            bytes: raw.to_vec(),
            compressed: false,
        })
    }

    /// Recover the original payload
    pub fn decode(&self, stored: &[u8], compressed: bool) -> Result<Vec<u8>> {
        if compressed {
            zstd::decode_all(stored).context("Failed to decompress payload")
        } else {
            Ok(stored.to_vec())
        }
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(1024, 3)
    }
}
