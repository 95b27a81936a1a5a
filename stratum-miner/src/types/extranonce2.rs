//! Extranonce2 counter.
//!
//! The pool grants each connection an extranonce2 width at subscribe time
//! (typically 4 to 8 bytes). Every job we hand to hardware gets its own
//! extranonce2 value so that no two jobs hash the same coinbase. The value is
//! serialized little-endian between extranonce1 and the coinbase suffix, and
//! the same bytes are hex-encoded when a share is submitted.

use std::fmt;

use thiserror::Error;

/// Errors that can occur when creating Extranonce2 values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("Invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(usize),

    #[error("Value {0:#x} exceeds maximum for size {1} bytes")]
    ValueTooLarge(u64, u8),
}

/// A fixed-width extranonce2 value.
///
/// Stored as a u64 but always serialized to exactly `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    /// Create a zero-valued extranonce2 of the given width.
    pub fn new(size: usize) -> Result<Self, Extranonce2Error> {
        Self::with_value(0, size)
    }

    /// Create an extranonce2 holding `value`.
    pub fn with_value(value: u64, size: usize) -> Result<Self, Extranonce2Error> {
        if size == 0 || size > 8 {
            return Err(Extranonce2Error::InvalidSize(size));
        }
        let size = size as u8;
        if value > Self::max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(value, size));
        }
        Ok(Self { value, size })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Width in bytes.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    fn max_for_size(size: u8) -> u64 {
        if size >= 8 {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        }
    }

    /// Advance to the next value, wrapping to zero after the maximum.
    ///
    /// Returns `false` when the counter wrapped (search space exhausted).
    pub fn increment(&mut self) -> bool {
        if self.value < Self::max_for_size(self.size) {
            self.value += 1;
            true
        } else {
            self.value = 0;
            false
        }
    }

    /// Append the serialized bytes to a coinbase under construction.
    pub fn extend_vec(&self, vec: &mut Vec<u8>) {
        vec.extend_from_slice(&self.value.to_le_bytes()[..self.size()]);
    }
}

impl From<Extranonce2> for Vec<u8> {
    fn from(ext: Extranonce2) -> Vec<u8> {
        ext.value.to_le_bytes()[..ext.size()].to_vec()
    }
}

/// Formats as the hex string sent in `mining.submit`: the serialized bytes in
/// coinbase order, two characters per byte.
impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.value.to_le_bytes()[..self.size()] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
