//! Compression support for list segments

use crate::error::{Error, Result};
use std::io::Write;

/// zstd level used for segments
const ZSTD_LEVEL: i32 = 3;

/// Segments smaller than this are never compressed
pub const MIN_COMPRESS_BYTES: usize = 48;

/// Compress segment bytes with zstd
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)
        .map_err(|e| Error::Internal(format!("Failed to create zstd encoder: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| Error::Internal(format!("Failed to compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("Failed to finish compression: {}", e)))
}

/// Decompress segment bytes
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| Error::Internal(format!("Failed to decompress: {}", e)))
}

/// Compresses `data` only when that saves space.
pub fn compress_if_smaller(data: &[u8]) -> Result<Option<Vec<u8>>> {
    if data.len() < MIN_COMPRESS_BYTES {
        return Ok(None);
    }
    let compressed = compress(data)?;
    Ok((compressed.len() < data.len()).then_some(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"list segment ".repeat(50);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_small_input_not_compressed() {
        assert!(compress_if_smaller(b"tiny").unwrap().is_none());
        assert!(compress_if_smaller(&[7u8; 4096]).unwrap().is_some());
    }
}
