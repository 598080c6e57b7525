//! In-place parallel MSD radix sort
//!
//! American-flag sort: one counting pass per byte level, then records are
//! cycled into their buckets by swapping, so no second buffer is needed.
//! Buckets are sorted recursively on the next byte, in parallel on the
//! current rayon pool once a level is large enough.

use rayon::prelude::*;

/// Levels smaller than this many records are insertion sorted
const INSERTION_THRESHOLD: usize = 32;

/// Levels at least this many bytes recurse in parallel
const PARALLEL_THRESHOLD_BYTES: usize = 1 << 16;

/// Sort `width`-byte records by their first `key_width` bytes, in place
///
/// Runs on the current rayon pool; install a pool to bound the threads.
///
/// # Panics
/// Panics if `key_width > width` or `data` is not a whole number of records.
pub fn msd_radix_sort(data: &mut [u8], width: usize, key_width: usize) {
    if width == 0 || key_width == 0 {
        return;
    }
    assert!(key_width <= width, "key width {key_width} exceeds record width {width}");
    assert_eq!(data.len() % width, 0, "buffer is not a whole number of records");
    sort_level(data, width, key_width, 0);
}

fn sort_level(data: &mut [u8], width: usize, key_width: usize, depth: usize) {
    let n = data.len() / width;
    if n < 2 || depth >= key_width {
        return;
    }
    if n <= INSERTION_THRESHOLD {
        insertion_sort(data, width, depth, key_width);
        return;
    }

    let mut counts = [0usize; 256];
    for record in data.chunks_exact(width) {
        counts[record[depth] as usize] += 1;
    }

    // every record shares this byte
    if counts.iter().any(|&c| c == n) {
        sort_level(data, width, key_width, depth + 1);
        return;
    }

    let mut heads = [0usize; 256];
    let mut ends = [0usize; 256];
    let mut sum = 0;
    for bucket in 0..256 {
        heads[bucket] = sum;
        sum += counts[bucket];
        ends[bucket] = sum;
    }

    for bucket in 0..256 {
        while heads[bucket] < ends[bucket] {
            let mut target = data[heads[bucket] * width + depth] as usize;
            while target != bucket {
                swap_records(data, width, heads[bucket], heads[target]);
                heads[target] += 1;
                target = data[heads[bucket] * width + depth] as usize;
            }
            heads[bucket] += 1;
        }
    }

    let total_bytes = data.len();
    let mut rest = data;
    let mut buckets = Vec::new();
    for &count in counts.iter() {
        if count == 0 {
            continue;
        }
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(count * width);
        if count > 1 {
            buckets.push(head);
        }
        rest = tail;
    }

    if total_bytes >= PARALLEL_THRESHOLD_BYTES {
        buckets
            .into_par_iter()
            .for_each(|bucket| sort_level(bucket, width, key_width, depth + 1));
    } else {
        for bucket in buckets {
            sort_level(bucket, width, key_width, depth + 1);
        }
    }
}

fn insertion_sort(data: &mut [u8], width: usize, depth: usize, key_width: usize) {
    let n = data.len() / width;
    for i in 1..n {
        let mut j = i;
        while j > 0 {
            let prev = &data[(j - 1) * width + depth..(j - 1) * width + key_width];
            let cur = &data[j * width + depth..j * width + key_width];
            if prev <= cur {
                break;
            }
            swap_records(data, width, j - 1, j);
            j -= 1;
        }
    }
}

#[inline]
fn swap_records(data: &mut [u8], width: usize, a: usize, b: usize) {
    if a == b {
        return;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (left, right) = data.split_at_mut(hi * width);
    left[lo * width..(lo + 1) * width].swap_with_slice(&mut right[..width]);
}
