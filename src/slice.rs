//! Slice masks: the position sets that partition a 20-mer into disjoint
//! buckets so that any two signatures within `K` mismatches share at least
//! one slice key (pigeonhole).

use crate::error::IsslError;
use crate::signature::{Signature, SEQ_LENGTH};

/// A slice: the set of positions (by ascending index) that form its key,
/// plus the packed 64-bit mask word stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceMask {
    /// Ascending positions belonging to this slice.
    pub positions: Vec<u8>,
    /// Bit `j` set iff position `j` belongs to this slice.
    pub mask_word: u64,
}

impl SliceMask {
    pub fn from_positions(mut positions: Vec<u8>) -> Self {
        positions.sort_unstable();
        let mask_word = positions.iter().fold(0u64, |acc, &p| acc | (1u64 << p));
        SliceMask {
            positions,
            mask_word,
        }
    }

    pub fn from_mask_word(mask_word: u64) -> Self {
        let positions = (0..SEQ_LENGTH as u8)
            .filter(|&j| mask_word & (1u64 << j) != 0)
            .collect();
        SliceMask {
            positions,
            mask_word,
        }
    }

    /// Width `w`: this slice has `4^w` buckets.
    #[inline]
    pub fn width(&self) -> u32 {
        self.positions.len() as u32
    }

    #[inline]
    pub fn bucket_count(&self) -> u64 {
        1u64 << (self.width() * 2)
    }

    /// Project a signature onto this slice's bucket key. The j-th set bit
    /// (ascending position) becomes bit-pair `j` of the key — the mask's
    /// set-bit order, not positional contiguity.
    #[inline]
    pub fn project(&self, sig: Signature) -> u64 {
        let mut key = 0u64;
        for (j, &pos) in self.positions.iter().enumerate() {
            let base = (sig.0 >> (pos * 2)) & 0x3;
            key |= base << (j * 2);
        }
        key
    }
}

/// Partition `[0, seq_len)` into `n_slices` disjoint, near-equal-width
/// contiguous slices (the default partitioner).
///
/// Widths are chosen so the low positions absorb any remainder, e.g.
/// seq_len=20, n=8 -> widths 3,3,3,3,2,2,2,2.
pub fn partition_contiguous(seq_len: usize, n_slices: usize) -> Result<Vec<SliceMask>, IsslError> {
    if n_slices == 0 {
        return Err(IsslError::Config("slice count must be > 0".into()));
    }
    if n_slices > seq_len {
        return Err(IsslError::Config(format!(
            "cannot partition {seq_len} positions into {n_slices} non-empty slices"
        )));
    }

    let base_width = seq_len / n_slices;
    let remainder = seq_len % n_slices;

    let mut masks = Vec::with_capacity(n_slices);
    let mut pos = 0usize;
    for i in 0..n_slices {
        let width = base_width + if i < remainder { 1 } else { 0 };
        let positions: Vec<u8> = (pos..pos + width).map(|p| p as u8).collect();
        masks.push(SliceMask::from_positions(positions));
        pos += width;
    }
    Ok(masks)
}

/// Validate the pigeonhole precondition `sliceCount > maxDist` and that the
/// slices are pairwise disjoint with union `[0, L)`.
pub fn validate_slices(masks: &[SliceMask], seq_len: usize, max_dist: u32) -> Result<(), IsslError> {
    if masks.len() as u32 <= max_dist {
        return Err(IsslError::Config(format!(
            "pigeonhole violated: {} slices cannot serve max distance {max_dist} (need N > K)",
            masks.len()
        )));
    }

    let mut seen = vec![false; seq_len];
    for mask in masks {
        for &p in &mask.positions {
            let p = p as usize;
            if p >= seq_len {
                return Err(IsslError::Config(format!(
                    "slice position {p} out of range for seq_len {seq_len}"
                )));
            }
            if seen[p] {
                return Err(IsslError::Config(format!(
                    "position {p} assigned to more than one slice"
                )));
            }
            seen[p] = true;
        }
    }
    if seen.iter().any(|&s| !s) {
        return Err(IsslError::Config(
            "slice masks do not cover every position".into(),
        ));
    }
    Ok(())
}
