//! Chunk filters: byte shuffling and lossless compression

use crate::error::{DcError, Result};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods supported for chunk storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    #[default]
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 2,
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Deflate compression
#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| DcError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size.unwrap_or(0));
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DcError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32).map_err(|e| DcError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| DcError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Group byte `k` of every element together
pub fn shuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() % elem_size != 0 {
        return data.to_vec();
    }
    let count = data.len() / elem_size;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(elem_size).enumerate() {
        for (k, &byte) in element.iter().enumerate() {
            out[k * count + i] = byte;
        }
    }
    out
}

/// Inverse of [`shuffle`]
pub fn unshuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() % elem_size != 0 {
        return data.to_vec();
    }
    let count = data.len() / elem_size;
    let mut out = vec![0u8; data.len()];
    for (i, element) in out.chunks_exact_mut(elem_size).enumerate() {
        for (k, byte) in element.iter_mut().enumerate() {
            *byte = data[k * count + i];
        }
    }
    out
}

/// Filters applied to every stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterPipeline {
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
    pub shuffle: bool,
}

impl FilterPipeline {
    /// Store chunks as raw bytes
    pub fn none() -> Self {
        Self::default()
    }

    /// Shuffle followed by fast deflate
    pub fn lossless() -> Self {
        Self::with_method(CompressionMethod::Deflate)
    }

    /// Shuffle followed by a fast level of `method`
    pub fn with_method(method: CompressionMethod) -> Self {
        Self {
            compression: method,
            level: CompressionLevel::fast(),
            shuffle: method != CompressionMethod::None,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.compression == CompressionMethod::None && !self.shuffle
    }

    pub fn encode(&self, raw: &[u8], elem_size: usize) -> Result<Vec<u8>> {
        if self.is_identity() {
            return Ok(raw.to_vec());
        }
        let shuffled = if self.shuffle {
            shuffle(raw, elem_size)
        } else {
            raw.to_vec()
        };
        get_compressor(self.compression).compress(&shuffled, self.level)
    }

    pub fn decode(&self, stored: &[u8], elem_size: usize, raw_len: usize) -> Result<Vec<u8>> {
        let decompressed = get_compressor(self.compression).decompress(stored, Some(raw_len))?;
        if decompressed.len() != raw_len {
            return Err(DcError::Decompression(format!(
                "Chunk decoded to {} bytes, expected {}",
                decompressed.len(),
                raw_len
            )));
        }
        Ok(if self.shuffle {
            unshuffle(&decompressed, elem_size)
        } else {
            decompressed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_compression() {
        let compressor = NoneCompressor;
        let data = b"Hello, world!";
        let compressed = compressor.compress(data, CompressionLevel::default()).unwrap();
        assert_eq!(compressed, data);
    }

    #[test]
    fn test_deflate() {
        let compressor = DeflateCompressor;
        let data = b"Hello, world! ".repeat(100);
        let compressed = compressor.compress(&data, CompressionLevel::default()).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed, Some(data.len())).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_zstd() {
        let compressor = ZstdCompressor;
        let data = b"Hello, world! ".repeat(100);
        let compressed = compressor.compress(&data, CompressionLevel::default()).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed, None).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_shuffle_layout() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let shuffled = shuffle(&data, 2);
        assert_eq!(shuffled, vec![1, 3, 5, 2, 4, 6]);
        assert_eq!(unshuffle(&shuffled, 2), data.to_vec());
    }

    #[test]
    fn test_pipeline_shrinks_smooth_data() {
        let values: Vec<u8> = (0u32..4096).flat_map(|v| v.to_le_bytes()).collect();
        let pipeline = FilterPipeline::lossless();
        let stored = pipeline.encode(&values, 4).unwrap();
        assert!(stored.len() < values.len() / 2);
        assert_eq!(pipeline.decode(&stored, 4, values.len()).unwrap(), values);
    }

    #[test]
    fn test_pipeline_rejects_wrong_length() {
        let pipeline = FilterPipeline::with_method(CompressionMethod::Zstd);
        let stored = pipeline.encode(&[0u8; 64], 8).unwrap();
        assert!(pipeline.decode(&stored, 8, 32).is_err());
    }
}
