//! Utility functions

use crate::error::{DcError, Result};
use crate::types::Element;
use std::mem;

/// Convert raw bytes to typed elements
pub fn bytes_to_typed_data<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = mem::size_of::<T>();
    if bytes.len() % size != 0 {
        return Err(DcError::ShapeMismatch(format!(
            "{} bytes are not a whole number of {}-byte elements",
            bytes.len(),
            size
        )));
    }

    let count = bytes.len() / size;
    let mut data = Vec::with_capacity(count);

    // SAFETY: `Element` types accept every bit pattern; reads are unaligned.
    unsafe {
        let ptr = bytes.as_ptr() as *const T;
        for i in 0..count {
            data.push(ptr.add(i).read_unaligned());
        }
    }

    Ok(data)
}

/// Convert typed elements to raw bytes
pub fn typed_data_to_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    let byte_len = mem::size_of_val(data);
    let mut bytes = vec![0u8; byte_len];

    // SAFETY: source and destination are distinct and both `byte_len` long.
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, bytes.as_mut_ptr(), byte_len);
    }

    bytes
}

/// Calculate checksum (CRC32) for data
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}

/// Verify checksum
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
