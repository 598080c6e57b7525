//! Aligned record buffers for the LSD sort
//!
//! The aligned sort needs its input to start on an alignment boundary.
//! Instead of copying, [`AlignedRecords`] appends `lead` duplicates of the
//! first records and sorts the window that starts `lead` records in:
//!
//! ```text
//! before:  r0 r1 .. r(lead-1) r(lead) .. r(n-1)
//! after:   r0 r1 .. r(lead-1) | r(lead) .. r(n-1) r0 .. r(lead-1) |
//!                             ^ aligned window of n records
//! ```
//!
//! The window holds exactly the original multiset of records. After the
//! sort the first `lead` records are stale and are skipped through the
//! start offset of the resulting [`SortedBatch`].

use super::hybrid::SortedBatch;

/// Number of records to skip so that `addr + lead * width` is a multiple of `alignment`
///
/// Returns `None` when no such count below `alignment` exists, which
/// happens when the record width shares a factor with the alignment that
/// the address does not.
pub fn padding_records(addr: usize, width: usize, alignment: usize) -> Option<usize> {
    if width == 0 || alignment == 0 {
        return None;
    }
    (0..alignment).find(|&lead| addr.wrapping_add(lead * width) % alignment == 0)
}

/// Record buffer padded so that a window of it starts on an alignment boundary
#[derive(Debug)]
pub struct AlignedRecords {
    data: Vec<u8>,
    width: usize,
    len: usize,
    lead: usize,
}

impl AlignedRecords {
    /// Pad `data` (records of `width` bytes) for `alignment`
    ///
    /// Capacity for the largest possible padding is reserved before the
    /// address is taken, so appending the padding never moves the buffer.
    ///
    /// # Errors
    /// Returns the untouched buffer when it cannot be aligned: the width
    /// cannot reach the boundary, or the padding needs more records than
    /// exist.
    pub fn new(mut data: Vec<u8>, width: usize, alignment: usize) -> Result<Self, Vec<u8>> {
        if width == 0 || data.len() % width != 0 {
            return Err(data);
        }
        let len = data.len() / width;
        data.reserve_exact(alignment * width);

        let addr = data.as_ptr() as usize;
        let lead = match padding_records(addr, width, alignment) {
            Some(lead) if lead <= len => lead,
            _ => return Err(data),
        };
        data.extend_from_within(..lead * width);
        debug_assert_eq!(data.as_ptr() as usize, addr);

        Ok(Self { data, width, len, lead })
    }

    /// Records skipped before the aligned window
    pub fn lead(&self) -> usize {
        self.lead
    }

    /// Number of records in the window
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the window holds no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the window in bytes
    pub fn window_bytes(&self) -> usize {
        self.len * self.width
    }

    /// The aligned window
    pub fn window(&self) -> &[u8] {
        &self.data[self.lead * self.width..(self.lead + self.len) * self.width]
    }

    /// The aligned window, mutable
    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.lead * self.width..(self.lead + self.len) * self.width]
    }

    /// Give up the buffer, keeping the window through the start offset
    pub fn into_sorted(self) -> SortedBatch {
        SortedBatch::with_offset(self.data, self.width, self.lead, self.len)
    }
}

/// Zero-filled scratch memory whose usable slice starts on an alignment boundary
pub struct ScratchBuffer {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl ScratchBuffer {
    /// Allocate `len` zeroed bytes aligned to `alignment`
    pub fn zeroed(len: usize, alignment: usize) -> Self {
        let raw = vec![0u8; len + alignment];
        let addr = raw.as_ptr() as usize;
        let offset = (alignment - addr % alignment) % alignment;
        Self { raw, offset, len }
    }

    /// The aligned slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}
