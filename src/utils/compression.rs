//! Payload compression used by the compression middleware.
//!
//! Every compressed payload is prefixed with a one-byte tag so the receiving
//! side knows whether, and how, to inflate it.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};

/// Supported algorithms
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Wire tag written in front of a payload compressed with this algorithm
    pub fn tag(self) -> u8 {
        match self {
            CompressionKind::Lz4 => TAG_LZ4,
            CompressionKind::Zstd => TAG_ZSTD,
        }
    }

    /// Algorithm for a wire tag; `None` for [`TAG_RAW`] or unknown tags
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_LZ4 => Some(CompressionKind::Lz4),
            TAG_ZSTD => Some(CompressionKind::Zstd),
            _ => None,
        }
    }
}

/// Tag for a payload sent uncompressed
pub const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Data below this many bits of entropy per byte is worth compressing
const MIN_ENTROPY_THRESHOLD: f64 = 4.0;

/// Shannon entropy of `data` in bits per byte (0.0 to 8.0)
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Size and entropy gate for compression
fn should_compress(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }
    if data.len() < 1024 {
        return true;
    }
    let sample = &data[..data.len().min(512)];
    calculate_entropy(sample) < MIN_ENTROPY_THRESHOLD
}

/// Compresses data using the specified compression algorithm
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data, refusing output larger than `limit` bytes
pub fn decompress(data: &[u8], kind: CompressionKind, limit: usize) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }
            // lz4_flex prepends the inflated size; check it before allocating
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > limit {
                return Err(ProtocolError::DecompressionFailure);
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            use std::io::Read;

            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            let mut out = Vec::new();
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > limit {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

/// Tag-prefixed payload: compressed when it is large, compressible and actually shrinks.
pub fn encode_tagged(data: &[u8], kind: CompressionKind, threshold_bytes: usize) -> Result<Vec<u8>> {
    if should_compress(data, threshold_bytes) {
        let compressed = compress(data, kind)?;
        if compressed.len() < data.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(kind.tag());
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(TAG_RAW);
    out.extend_from_slice(data);
    Ok(out)
}

/// Inverse of [`encode_tagged`], bounded by [`MAX_FRAME_SIZE`]
pub fn decode_tagged(data: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = data
        .split_first()
        .ok_or(ProtocolError::DecompressionFailure)?;
    if tag == TAG_RAW {
        return Ok(body.to_vec());
    }
    let kind = CompressionKind::from_tag(tag).ok_or(ProtocolError::DecompressionFailure)?;
    decompress(body, kind, MAX_FRAME_SIZE)
}
