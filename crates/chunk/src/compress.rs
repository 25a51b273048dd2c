//! Chunk payload compression with a negative-gain guard.

use basalt_common::{EngineError, Result, TransmissionCompression};

/// Compress `payload` with `codec`.
pub fn compress(codec: TransmissionCompression, payload: &[u8]) -> Result<Vec<u8>> {
    match codec {
        TransmissionCompression::None => Ok(payload.to_vec()),
        TransmissionCompression::Lz4 => Ok(lz4_flex::block::compress(payload)),
        TransmissionCompression::Zstd => zstd::stream::encode_all(payload, 0)
            .map_err(|e| EngineError::Internal(format!("zstd encode failed: {e}"))),
    }
}

/// Decompress a payload produced by [`compress`].
pub fn decompress(
    codec: TransmissionCompression,
    payload: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    match codec {
        TransmissionCompression::None => Ok(payload.to_vec()),
        TransmissionCompression::Lz4 => {
            lz4_flex::block::decompress(payload, uncompressed_size)
                .map_err(|e| EngineError::InvalidArgument(format!("lz4 decode failed: {e}")))
        }
        TransmissionCompression::Zstd => {
            let out = zstd::stream::decode_all(payload)
                .map_err(|e| EngineError::InvalidArgument(format!("zstd decode failed: {e}")))?;
            if out.len() != uncompressed_size {
                return Err(EngineError::InvalidArgument(format!(
                    "zstd payload decoded to {} bytes, expected {uncompressed_size}",
                    out.len()
                )));
            }
            Ok(out)
        }
    }
}

/// Compress and keep the result only when the ratio beats `min_ratio`.
///
/// Returns `None` when compression does not pay (already-compact payloads),
/// in which case the sender transmits the uncompressed form.
pub fn maybe_compress(
    codec: TransmissionCompression,
    payload: &[u8],
    min_ratio: f64,
) -> Result<Option<Vec<u8>>> {
    if codec == TransmissionCompression::None || payload.is_empty() {
        return Ok(None);
    }
    let compressed = compress(codec, payload)?;
    if compressed.is_empty() {
        return Ok(None);
    }
    let ratio = payload.len() as f64 / compressed.len() as f64;
    if ratio > min_ratio {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}
