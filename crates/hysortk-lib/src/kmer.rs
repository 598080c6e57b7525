//! K-mer representation with const generics and optimal storage
//!
//! K-mers of every length from 2 to 63 are supported. Storage is selected
//! at compile time (u64 for K ≤ 31, u128 for K > 31). Base `i` of a k-mer
//! sits in bits `2i..2i+2`, so the first base of the string is the least
//! significant pair.
//!
//! For sorting and for the wire, a k-mer is written as its
//! [`KmerBits::BYTES`]-byte big-endian value: byte order equals numeric
//! order, which lets the radix sorts work on raw bytes.

use crate::encoding::{decode_base, encode_base, EncodingError};
use crate::hasher::DeterministicHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Trait defining optimal storage type for a given K
///
/// Implemented for every K in `2..=63`.
/// - K ≤ 31: uses u64 (8 bytes)
/// - K > 31: uses u128 (16 bytes)
pub trait KmerBits: Sized {
    /// The underlying storage type (u64 or u128)
    type Storage: Copy + Ord + Hash + fmt::Debug + Send + Sync + 'static;

    /// Number of bits in the storage type
    const BITS: usize;

    /// Number of bytes in the sort key (`ceil(2K / 8)`)
    const BYTES: usize;

    /// Convert storage to u8 (truncates)
    fn to_u8(val: Self::Storage) -> u8;

    /// Convert storage to u128
    fn to_u128(val: Self::Storage) -> u128;

    /// Convert u8 to storage
    fn from_u8(val: u8) -> Self::Storage;

    /// Convert u128 to storage (truncates)
    fn from_u128(val: u128) -> Self::Storage;

    /// Shift left on storage
    fn shl(val: Self::Storage, bits: usize) -> Self::Storage;

    /// Shift right on storage
    fn shr(val: Self::Storage, bits: usize) -> Self::Storage;

    /// Bitwise AND on storage
    fn bitand(a: Self::Storage, b: Self::Storage) -> Self::Storage;

    /// Bitwise OR on storage
    fn bitor(a: Self::Storage, b: Self::Storage) -> Self::Storage;
}

macro_rules! impl_kmer_bits {
    ($storage:ty, $bits:literal; $($k:literal),* $(,)?) => {
        $(
            impl KmerBits for Kmer<$k> {
                type Storage = $storage;
                const BITS: usize = $bits;
                const BYTES: usize = (2 * $k + 7) / 8;

                #[inline]
                fn to_u8(val: Self::Storage) -> u8 {
                    val as u8
                }

                #[inline]
                fn to_u128(val: Self::Storage) -> u128 {
                    val as u128
                }

                #[inline]
                fn from_u8(val: u8) -> Self::Storage {
                    val as $storage
                }

                #[inline]
                fn from_u128(val: u128) -> Self::Storage {
                    val as $storage
                }

                #[inline]
                fn shl(val: Self::Storage, bits: usize) -> Self::Storage {
                    val << bits
                }

                #[inline]
                fn shr(val: Self::Storage, bits: usize) -> Self::Storage {
                    val >> bits
                }

                #[inline]
                fn bitand(a: Self::Storage, b: Self::Storage) -> Self::Storage {
                    a & b
                }

                #[inline]
                fn bitor(a: Self::Storage, b: Self::Storage) -> Self::Storage {
                    a | b
                }
            }
        )*
    };
}

impl_kmer_bits!(u64, 64;
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
    27, 28, 29, 30, 31);

impl_kmer_bits!(u128, 128;
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54,
    55, 56, 57, 58, 59, 60, 61, 62, 63);

/// Run `$body` with `$K` bound to the runtime k-mer length `$k` as a const
///
/// ```
/// use hysortk_lib::{dispatch_on_k, Kmer, KmerBits};
///
/// fn key_bytes<const K: usize>() -> usize
/// where
///     Kmer<K>: KmerBits,
/// {
///     <Kmer<K> as KmerBits>::BYTES
/// }
///
/// let k = 31;
/// assert_eq!(dispatch_on_k!(k, K => key_bytes::<K>()), 8);
/// ```
///
/// # Panics
/// Panics if `$k` is outside `2..=63`; validate the configuration first.
#[macro_export]
macro_rules! dispatch_on_k {
    ($k:expr, $K:ident => $body:expr) => {
        $crate::__dispatch_on_k_arms!($k, $K, $body;
            2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
            25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45,
            46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __dispatch_on_k_arms {
    ($k:expr, $K:ident, $body:expr; $($v:literal),*) => {
        match $k {
            $(
                $v => {
                    const $K: usize = $v;
                    $body
                }
            )*
            other => panic!("unsupported k-mer length {}", other),
        }
    };
}

/// K-mer representation with compile-time size and optimal storage
///
/// # Example
/// ```
/// use hysortk_lib::kmer::Kmer;
///
/// let kmer: Kmer<5> = Kmer::from_str("ACGTG").unwrap();
/// assert_eq!(kmer.reverse_complement().to_string(), "CACGT");
/// assert_eq!(kmer.canonical(), kmer.reverse_complement().canonical());
/// ```
#[derive(Clone, Copy)]
pub struct Kmer<const K: usize>
where
    Kmer<K>: KmerBits,
{
    bits: <Kmer<K> as KmerBits>::Storage,
}

impl<const K: usize> Kmer<K>
where
    Kmer<K>: KmerBits,
{
    /// Number of bytes in the sort key
    pub const BYTES: usize = <Kmer<K> as KmerBits>::BYTES;

    /// Create a new k-mer from raw bits
    #[inline]
    pub fn new(bits: <Kmer<K> as KmerBits>::Storage) -> Self {
        Self { bits }
    }

    /// Create a k-mer from a u128 value (truncated to storage size)
    #[inline]
    pub fn from_bits(bits: u128) -> Self {
        Self { bits: <Kmer<K> as KmerBits>::from_u128(bits) }
    }

    /// Get the raw bits
    #[inline]
    pub fn bits(&self) -> <Kmer<K> as KmerBits>::Storage {
        self.bits
    }

    /// Get the raw bits widened to u128
    #[inline]
    pub fn as_u128(&self) -> u128 {
        <Kmer<K> as KmerBits>::to_u128(self.bits)
    }

    /// Create a k-mer from a DNA string
    ///
    /// This is an inherent method so callers don't need to import [`std::str::FromStr`].
    ///
    /// # Errors
    /// Returns an error if the string length doesn't match K or contains invalid bases.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EncodingError> {
        <Self as std::str::FromStr>::from_str(s)
    }

    /// Build a k-mer from the first K 2-bit codes of `codes`
    ///
    /// # Panics
    /// Panics if `codes` holds fewer than K codes.
    #[inline]
    pub fn from_codes(codes: &[u8]) -> Self {
        let mut bits = <Kmer<K> as KmerBits>::from_u8(0);
        for (i, &code) in codes[..K].iter().enumerate() {
            let shifted = <Kmer<K> as KmerBits>::shl(
                <Kmer<K> as KmerBits>::from_u8(code & 0b11),
                i * 2,
            );
            bits = <Kmer<K> as KmerBits>::bitor(bits, shifted);
        }
        Self { bits }
    }

    /// Slide the window one base forward
    ///
    /// The first base is dropped and `code` becomes the last base, so
    /// pushing the bases of a read one by one walks its k-mers in order.
    #[inline]
    pub fn push_base(self, code: u8) -> Self {
        let shifted = <Kmer<K> as KmerBits>::shr(self.bits, 2);
        let incoming = <Kmer<K> as KmerBits>::shl(
            <Kmer<K> as KmerBits>::from_u8(code & 0b11),
            2 * (K - 1),
        );
        Self { bits: <Kmer<K> as KmerBits>::bitor(shifted, incoming) }
    }

    /// Get the reverse complement of this k-mer
    ///
    /// Uses bit-parallel operations: complement via XOR, then reverse 2-bit pairs.
    #[inline]
    pub fn reverse_complement(&self) -> Self {
        if K <= 31 {
            let mut x = <Kmer<K> as KmerBits>::to_u128(self.bits) as u64;
            // XOR with 0b10 pairs flips A<->T, C<->G
            x ^= 0xAAAA_AAAA_AAAA_AAAAu64;
            x = ((x >> 2) & 0x3333_3333_3333_3333u64) | ((x & 0x3333_3333_3333_3333u64) << 2);
            x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0Fu64) | ((x & 0x0F0F_0F0F_0F0F_0F0Fu64) << 4);
            x = x.swap_bytes();
            x >>= 64 - K * 2;
            Self { bits: <Kmer<K> as KmerBits>::from_u128(x as u128) }
        } else {
            let mut x = <Kmer<K> as KmerBits>::to_u128(self.bits);
            x ^= 0xAAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAAu128;
            x = ((x >> 2) & 0x3333_3333_3333_3333_3333_3333_3333_3333u128)
              | ((x & 0x3333_3333_3333_3333_3333_3333_3333_3333u128) << 2);
            x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0Fu128)
              | ((x & 0x0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0Fu128) << 4);
            x = x.swap_bytes();
            x >>= 128 - K * 2;
            Self { bits: <Kmer<K> as KmerBits>::from_u128(x) }
        }
    }

    /// Get the canonical representation (minimum of forward and reverse complement)
    #[inline]
    pub fn canonical(&self) -> Self {
        let rc = self.reverse_complement();
        if self.bits <= rc.bits {
            *self
        } else {
            rc
        }
    }

    /// Extract a base at a specific position (0-indexed)
    pub fn get_base(&self, pos: usize) -> u8 {
        assert!(pos < K, "Position {} out of bounds for k-mer of length {}", pos, K);
        <Kmer<K> as KmerBits>::to_u8(<Kmer<K> as KmerBits>::bitand(
            <Kmer<K> as KmerBits>::shr(self.bits, pos * 2),
            <Kmer<K> as KmerBits>::from_u8(0b11),
        ))
    }

    /// 64-bit hash of the k-mer under a seeded hasher
    #[inline]
    pub fn hash_with(&self, hasher: &DeterministicHasher) -> u64 {
        hasher.hash_u128(self.as_u128())
    }

    /// Write the big-endian sort key into the first [`Self::BYTES`] bytes of `out`
    #[inline]
    pub fn write_key(&self, out: &mut [u8]) {
        let be = self.as_u128().to_be_bytes();
        out[..Self::BYTES].copy_from_slice(&be[16 - Self::BYTES..]);
    }

    /// Rebuild a k-mer from a sort key written by [`write_key`](Self::write_key)
    #[inline]
    pub fn from_key(key: &[u8]) -> Self {
        let mut be = [0u8; 16];
        be[16 - Self::BYTES..].copy_from_slice(&key[..Self::BYTES]);
        Self::from_bits(u128::from_be_bytes(be))
    }
}

impl<const K: usize> PartialEq for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<const K: usize> Eq for Kmer<K> where Kmer<K>: KmerBits {}

impl<const K: usize> PartialOrd for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const K: usize> Ord for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bits.cmp(&other.bits)
    }
}

impl<const K: usize> Hash for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<const K: usize> fmt::Debug for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kmer<{}>(\"{}\")", K, self)
    }
}

impl<const K: usize> fmt::Display for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pos in 0..K {
            write!(f, "{}", decode_base(self.get_base(pos)) as char)?;
        }
        Ok(())
    }
}

impl<const K: usize> Default for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    fn default() -> Self {
        Self { bits: <Kmer<K> as KmerBits>::from_u8(0) }
    }
}

impl<const K: usize> std::str::FromStr for Kmer<K>
where
    Kmer<K>: KmerBits,
{
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != K {
            return Err(EncodingError::LengthMismatch {
                expected: K,
                actual: s.len(),
            });
        }

        let mut bits = <Kmer<K> as KmerBits>::from_u8(0);
        for (i, &base) in s.as_bytes().iter().enumerate() {
            let encoded = encode_base(base)?;
            let shifted = <Kmer<K> as KmerBits>::shl(
                <Kmer<K> as KmerBits>::from_u8(encoded),
                i * 2,
            );
            bits = <Kmer<K> as KmerBits>::bitor(bits, shifted);
        }

        Ok(Self { bits })
    }
}
