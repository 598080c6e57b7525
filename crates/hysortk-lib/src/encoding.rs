//! DNA nucleotide encoding
//!
//! Reads, supermers and k-mers all share one 2-bit alphabet:
//! - A (65/97)  -> 00
//! - C (67/99)  -> 01
//! - G (71/103) -> 11
//! - T (84/116) -> 10
//!
//! With this assignment the complement of a code is `code ^ 0b10`.
//! Supermer payloads pack four codes per byte, base `i` of a record living
//! in bits `2 * (i % 4)` of byte `i / 4`.

use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base: {0:?}")]
    InvalidBase(u8),
    /// The input string length does not match the expected k-mer length
    #[error("K-mer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected k-mer length
        expected: usize,
        /// Actual string length
        actual: usize,
    },
}

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub const fn encode_base(base: u8) -> Result<u8, EncodingError> {
    match base {
        b'A' | b'a' => Ok(0b00),
        b'C' | b'c' => Ok(0b01),
        b'G' | b'g' => Ok(0b11),
        b'T' | b't' => Ok(0b10),
        _ => Err(EncodingError::InvalidBase(base)),
    }
}

/// Decode a 2-bit value to DNA nucleotide (uppercase)
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b11 => b'G',
        0b10 => b'T',
        _ => unreachable!(),
    }
}

/// Get the complement of a DNA base (encoded)
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    bits ^ 0b10
}

/// Number of bytes needed to pack `num_bases` codes
#[inline]
pub const fn packed_len(num_bases: usize) -> usize {
    num_bases.div_ceil(4)
}

/// Append `codes` to `out`, packed four per byte
///
/// Codes must already be 2-bit values; higher bits are masked off.
pub fn pack_codes(codes: &[u8], out: &mut Vec<u8>) {
    for chunk in codes.chunks(4) {
        let mut byte = 0u8;
        for (i, &code) in chunk.iter().enumerate() {
            byte |= (code & 0b11) << (2 * i);
        }
        out.push(byte);
    }
}

/// Read the `index`-th code from a packed buffer
#[inline]
pub fn unpack_code(packed: &[u8], index: usize) -> u8 {
    (packed[index / 4] >> (2 * (index % 4))) & 0b11
}

/// Encode an ASCII DNA sequence to one 2-bit code per byte
///
/// # Errors
/// Returns an error if the sequence contains a non-ACGT byte
pub fn encode_sequence(sequence: &[u8]) -> Result<Vec<u8>, EncodingError> {
    sequence.iter().map(|&b| encode_base(b)).collect()
}

/// Decode a packed buffer of `length` bases back to a DNA string
pub fn decode_packed(data: &[u8], length: usize) -> String {
    let length = length.min(data.len() * 4);
    (0..length)
        .map(|i| decode_base(unpack_code(data, i)) as char)
        .collect()
}
