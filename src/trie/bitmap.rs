//! Bit vector with rank/select indexes

const SELECT_SAMPLE: usize = 64;

/// Append-only bit vector answering `rank1` and `select1` queries
///
/// Call [`BitVec::build_index`] once all bits are set.
#[derive(Debug, Clone, Default)]
pub(crate) struct BitVec {
    words: Vec<u64>,
    /// `ranks[w]` is the number of ones in `words[..w]`
    ranks: Vec<u32>,
    /// `selects[k]` is the word holding the `k * SELECT_SAMPLE`-th one
    selects: Vec<u32>,
}

impl BitVec {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&mut self, i: usize) {
        let word = i >> 6;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (i & 63);
    }

    /// Make sure bit `i` is addressable without setting it
    pub(crate) fn reserve_bit(&mut self, i: usize) {
        let word = i >> 6;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
    }

    /// Out-of-range bits read as zero
    pub(crate) fn get(&self, i: usize) -> bool {
        self.words
            .get(i >> 6)
            .is_some_and(|w| w & (1 << (i & 63)) != 0)
    }

    pub(crate) fn build_index(&mut self) {
        self.ranks = Vec::with_capacity(self.words.len() + 1);
        self.selects.clear();

        let mut ones = 0u32;
        let mut next_sample = 0u32;
        for (idx, word) in self.words.iter().enumerate() {
            self.ranks.push(ones);
            ones += word.count_ones();
            while next_sample < ones {
                self.selects.push(idx as u32);
                next_sample += SELECT_SAMPLE as u32;
            }
        }
        self.ranks.push(ones);
    }

    /// Number of ones strictly before bit `i`
    pub(crate) fn rank1(&self, i: usize) -> usize {
        let word = i >> 6;
        if word >= self.words.len() {
            return self.ranks.last().copied().unwrap_or(0) as usize;
        }
        let mask = (1u64 << (i & 63)) - 1;
        self.ranks[word] as usize + (self.words[word] & mask).count_ones() as usize
    }

    /// Number of zeros strictly before bit `i`
    pub(crate) fn count_zeros(&self, i: usize) -> usize {
        i - self.rank1(i)
    }

    /// Position of the `i`-th one (0-based)
    ///
    /// Returns the bit length of the vector when fewer ones exist.
    pub(crate) fn select1(&self, i: usize) -> usize {
        let Some(&start) = self.selects.get(i / SELECT_SAMPLE) else {
            return self.words.len() * 64;
        };

        let mut word = start as usize;
        while word + 1 < self.ranks.len() - 1 && self.ranks[word + 1] as usize <= i {
            word += 1;
        }

        let mut bits = self.words[word];
        for _ in 0..(i - self.ranks[word] as usize) {
            bits &= bits - 1;
        }
        word * 64 + bits.trailing_zeros() as usize
    }
}
