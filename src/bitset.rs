//! A fixed-size, exclusively-owned "seen" bitset.
//!
//! One instance lives per scoring worker: allocated once
//! at thread start, zeroed between guides, never shared.

/// `ceil(capacity / 64)` 64-bit words of "has this off-target id been
/// scored for the current guide" flags.
pub struct SeenSet {
    words: Vec<u64>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let n_words = capacity.div_ceil(64);
        SeenSet {
            words: vec![0u64; n_words],
        }
    }

    /// Test-and-set bit `id`. Returns `true` if it was already set.
    #[inline]
    pub fn test_and_set(&mut self, id: u32) -> bool {
        let idx = (id / 64) as usize;
        let bit = 1u64 << (id % 64);
        let already = self.words[idx] & bit != 0;
        self.words[idx] |= bit;
        already
    }

    /// Zero every word, ready for the next guide.
    #[inline]
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}
