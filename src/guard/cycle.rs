//! Stage path ring buffer and back-to-back repetition detection.

use crate::stage::StageId;
use std::collections::VecDeque;

/// A stage block found repeating at the tail of the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repetition {
    /// The repeating block, oldest stage first.
    pub pattern: Vec<StageId>,
    /// Copies of the block beyond the first.
    pub repeats: u32,
}

/// Last N stages entered by a run.
#[derive(Debug, Clone)]
pub struct PathTracker {
    path: VecDeque<StageId>,
    capacity: usize,
}

impl PathTracker {
    /// Create a tracker keeping at most `capacity` stages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            path: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a stage, dropping the oldest when full.
    pub fn push(&mut self, stage: StageId) {
        if self.path.len() == self.capacity {
            self.path.pop_front();
        }
        self.path.push_back(stage);
    }

    /// Number of stages retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.path.len()
    }

    /// Check if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Copy of the retained path, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<StageId> {
        self.path.iter().copied().collect()
    }

    /// Find the most-repeated block of length `1..=max_len` ending at the tail.
    ///
    /// Only contiguous copies immediately preceding the tail count, so a
    /// block that recurred long ago and then stopped is not reported.
    #[must_use]
    pub fn tail_repetition(&self, max_len: usize) -> Option<Repetition> {
        let n = self.path.len();
        let mut best: Option<Repetition> = None;

        for len in 1..=max_len.min(n / 2) {
            let copies = self.tail_copies(len);
            if copies < 2 {
                continue;
            }
            let repeats = u32::try_from(copies - 1).unwrap_or(u32::MAX);
            if best.as_ref().is_none_or(|b| repeats > b.repeats) {
                best = Some(Repetition {
                    pattern: self.path.range(n - len..).copied().collect(),
                    repeats,
                });
            }
        }
        best
    }

    /// Number of back-to-back copies of the last `len` stages.
    fn tail_copies(&self, len: usize) -> usize {
        let n = self.path.len();
        let block_matches = |copy: usize| {
            let start = n - (copy + 1) * len;
            (0..len).all(|i| self.path[start + i] == self.path[n - len + i])
        };

        let mut copies = 1;
        while (copies + 1) * len <= n && block_matches(copies) {
            copies += 1;
        }
        copies
    }
}
