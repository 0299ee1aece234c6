use std::fmt;

use basalt_primitives::Height;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainError {
    ForkRangeContradiction,
    NonMonotonicAppend,
    BadShrink,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::ForkRangeContradiction => write!(f, "fork range contradiction"),
            ChainError::NonMonotonicAppend => write!(f, "append did not grow the chain"),
            ChainError::BadShrink => write!(f, "shrink did not reduce the chain"),
        }
    }
}

impl std::error::Error for ChainError {}

// Where may a peer's chain fork from ours? Heights below `lower` are
// confirmed to agree. The upper bound of the undetermined interval is the
// tighter of a confirmed mismatch height and the shared-length bound
// min(our_length, their_length) + 1. Probing narrows [lower, upper) until
// it is empty; a reorg on either side voids knowledge above the reorg
// height and may reopen it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForkRange {
    lower: Height,
    mismatch: Option<Height>,
    len_bound: Height,
}

impl ForkRange {
    pub fn new(lower: Height, len_bound: Height) -> Self {
        Self {
            lower: lower.min(len_bound),
            mismatch: None,
            len_bound,
        }
    }

    pub fn lower(&self) -> Height {
        self.lower
    }

    pub fn upper(&self) -> Height {
        match self.mismatch {
            Some(mismatch) => mismatch.min(self.len_bound),
            None => self.len_bound,
        }
    }

    pub fn settled(&self) -> bool {
        self.lower >= self.upper()
    }

    pub fn probe_height(&self) -> Option<Height> {
        if self.settled() {
            return None;
        }
        Some(self.lower + (self.upper() - self.lower) / 2)
    }

    pub fn on_match(&mut self, height: Height) -> Result<(), ChainError> {
        if let Some(mismatch) = self.mismatch {
            if height >= mismatch {
                return Err(ChainError::ForkRangeContradiction);
            }
        }
        self.lower = self.lower.max(height + 1);
        Ok(())
    }

    pub fn on_mismatch(&mut self, height: Height) -> Result<(), ChainError> {
        if height < self.lower {
            return Err(ChainError::ForkRangeContradiction);
        }
        self.mismatch = Some(match self.mismatch {
            Some(mismatch) => mismatch.min(height),
            None => height,
        });
        Ok(())
    }

    // A reorg (ours or theirs) at `height` voids everything learned from
    // that height up; agreement and mismatch below it survive.
    pub fn reorg(&mut self, height: Height) {
        self.lower = self.lower.min(height);
        if let Some(mismatch) = self.mismatch {
            if mismatch >= height {
                self.mismatch = None;
            }
        }
    }

    // Called whenever either chain's length changes.
    pub fn set_len_bound(&mut self, len_bound: Height) {
        self.len_bound = len_bound;
        self.lower = self.lower.min(len_bound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrows_to_fork_point() {
        let mut range = ForkRange::new(1, 11);
        range.on_match(5).expect("match");
        assert_eq!(range.lower(), 6);
        range.on_mismatch(8).expect("mismatch");
        assert_eq!(range.upper(), 8);
        range.on_match(7).expect("match");
        assert!(range.settled());
        assert_eq!(range.lower(), 8);
    }

    #[test]
    fn contradiction_detected() {
        let mut range = ForkRange::new(1, 6);
        range.on_mismatch(3).expect("mismatch");
        assert_eq!(range.on_match(4), Err(ChainError::ForkRangeContradiction));
        range.on_match(2).expect("match below mismatch");
        assert_eq!(range.on_mismatch(1), Err(ChainError::ForkRangeContradiction));
    }

    #[test]
    fn probe_height_bisects() {
        assert_eq!(ForkRange::new(1, 9).probe_height(), Some(5));
        // width-one interval probes the single open height
        assert_eq!(ForkRange::new(3, 4).probe_height(), Some(3));
        assert_eq!(ForkRange::new(3, 3).probe_height(), None);
    }

    #[test]
    fn reorg_reopens_the_range() {
        let mut range = ForkRange::new(1, 11);
        range.on_match(9).expect("match");
        range.on_mismatch(10).expect("mismatch");
        assert!(range.settled());

        // a reorg at height 4 voids everything from 4 up
        range.reorg(4);
        assert_eq!(range.lower(), 4);
        assert!(!range.settled());
        assert_eq!(range.upper(), 11);
    }

    #[test]
    fn reorg_keeps_lower_knowledge() {
        let mut range = ForkRange::new(1, 11);
        range.on_match(3).expect("match");
        range.on_mismatch(6).expect("mismatch");
        range.reorg(8);
        // mismatch at 6 is below the reorg height, it survives
        assert_eq!(range.lower(), 4);
        assert_eq!(range.upper(), 6);
    }

    #[test]
    fn growing_chains_extend_the_range() {
        let mut range = ForkRange::new(1, 6);
        range.on_match(5).expect("match");
        assert!(range.settled());
        range.set_len_bound(9);
        assert!(!range.settled());
        assert_eq!(range.lower(), 6);
        assert_eq!(range.upper(), 9);
    }
}
