use basalt_pow::Worksum;
use basalt_primitives::Height;

use crate::header_chain::{HeaderChain, HeaderChainError};
use crate::snapshot::{SignedSnapshot, SnapshotPriority};
use crate::updates::{Append, Fork, RollbackData};

// Broadcast material produced by a consensus update, mirrored into the
// corresponding wire message by the event loop.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendInfo {
    pub new_length: Height,
    pub worksum: Worksum,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForkInfo {
    pub fork_height: Height,
    pub new_length: Height,
    pub worksum: Worksum,
    pub descriptor: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RollbackInfo {
    pub shrink_length: Height,
    pub worksum: Worksum,
    pub descriptor: u32,
    pub snapshot: SignedSnapshot,
}

// Twin chain view: `consensus` is the locally validated chain, `stage` the
// heavier candidate currently being body-checked. The descriptor changes
// whenever consensus loses a suffix, so peers can tell our histories apart.
#[derive(Clone, Debug)]
pub struct StageAndConsensus {
    descriptor: u32,
    consensus: HeaderChain,
    stage: HeaderChain,
    snapshot: Option<SignedSnapshot>,
}

impl StageAndConsensus {
    pub fn new(consensus: HeaderChain, snapshot: Option<SignedSnapshot>) -> Self {
        let stage = consensus.clone();
        Self {
            descriptor: 1,
            consensus,
            stage,
            snapshot,
        }
    }

    pub fn descriptor(&self) -> u32 {
        self.descriptor
    }

    pub fn consensus_headers(&self) -> &HeaderChain {
        &self.consensus
    }

    pub fn consensus_length(&self) -> Height {
        self.consensus.length()
    }

    pub fn consensus_work(&self) -> Worksum {
        self.consensus.total_work()
    }

    pub fn stage_headers(&self) -> &HeaderChain {
        &self.stage
    }

    pub fn signed_snapshot(&self) -> Option<&SignedSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_priority(&self) -> SnapshotPriority {
        self.snapshot
            .as_ref()
            .map(|s| s.priority)
            .unwrap_or_default()
    }

    pub fn update_consensus_append(&mut self, append: Append) -> Result<AppendInfo, HeaderChainError> {
        self.consensus.append(&append.headers)?;
        if self.stage.total_work() < self.consensus.total_work() {
            self.stage = self.consensus.clone();
        }
        Ok(AppendInfo {
            new_length: self.consensus.length(),
            worksum: self.consensus.total_work(),
        })
    }

    pub fn update_consensus_fork(&mut self, fork: Fork) -> Result<ForkInfo, HeaderChainError> {
        self.consensus.truncate(fork.fork_height.saturating_sub(1));
        self.consensus.append(&fork.headers)?;
        self.descriptor += 1;
        if self.stage.total_work() < self.consensus.total_work() {
            self.stage = self.consensus.clone();
        }
        Ok(ForkInfo {
            fork_height: fork.fork_height,
            new_length: self.consensus.length(),
            worksum: self.consensus.total_work(),
            descriptor: self.descriptor,
        })
    }

    // Returns None when consensus was already short enough; the snapshot is
    // recorded either way.
    pub fn update_consensus_rollback(&mut self, rollback: &RollbackData) -> Option<RollbackInfo> {
        let shrank = self.consensus.length() > rollback.shrink_length;
        if shrank {
            self.consensus.truncate(rollback.shrink_length);
            self.descriptor += 1;
        }
        if !rollback.snapshot.compatible(&self.stage) {
            self.stage = self.consensus.clone();
        }
        self.snapshot = Some(rollback.snapshot.clone());
        if !shrank {
            return None;
        }
        Some(RollbackInfo {
            shrink_length: rollback.shrink_length,
            worksum: self.consensus.total_work(),
            descriptor: self.descriptor,
            snapshot: rollback.snapshot.clone(),
        })
    }

    // Promote a freshly downloaded header chain to stage; returns the height
    // at which it diverges from consensus.
    pub fn update_stage(&mut self, chain: HeaderChain) -> Height {
        let fork_height = self.consensus.fork_height(&chain);
        self.stage = chain;
        fork_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_chain::testutil::extend;
    use crate::snapshot::SIGNATURE_LEN;

    fn base_chain(len: usize) -> HeaderChain {
        let mut chain = HeaderChain::new();
        let headers = extend(&chain, len, 1);
        chain.append(&headers).expect("append");
        chain
    }

    #[test]
    fn append_advances_consensus_and_stage() {
        let mut chains = StageAndConsensus::new(base_chain(2), None);
        let headers = extend(chains.consensus_headers(), 3, 1);
        let info = chains
            .update_consensus_append(Append { headers })
            .expect("append");
        assert_eq!(info.new_length, 5);
        assert_eq!(chains.stage_headers().length(), 5);
        assert_eq!(chains.descriptor(), 1);
    }

    #[test]
    fn fork_bumps_descriptor() {
        let mut chains = StageAndConsensus::new(base_chain(4), None);
        let mut alt = chains.consensus_headers().clone();
        alt.truncate(2);
        let headers = extend(&alt, 4, 9);
        let info = chains
            .update_consensus_fork(Fork {
                fork_height: 3,
                headers,
            })
            .expect("fork");
        assert_eq!(info.descriptor, 2);
        assert_eq!(info.fork_height, 3);
        assert_eq!(chains.consensus_length(), 6);
    }

    #[test]
    fn rollback_shrinks_consensus_keeps_compatible_stage() {
        let consensus = base_chain(5);
        let mut chains = StageAndConsensus::new(consensus.clone(), None);

        // stage a heavier chain forking at 4
        let mut candidate = consensus.clone();
        candidate.truncate(3);
        candidate.append(&extend(&candidate, 5, 9)).expect("stage");
        chains.update_stage(candidate);

        let snapshot = SignedSnapshot {
            priority: SnapshotPriority {
                importance: 3,
                height: 2,
            },
            hash: consensus.hash_at(2).expect("hash"),
            signature: [1u8; SIGNATURE_LEN],
        };
        let info = chains
            .update_consensus_rollback(&RollbackData {
                snapshot: snapshot.clone(),
                shrink_length: 2,
            })
            .expect("shrank");
        assert_eq!(info.shrink_length, 2);
        assert_eq!(info.descriptor, 2);
        assert_eq!(chains.consensus_length(), 2);
        // the staged fork agreed with the snapshot at height 2, so it stays
        assert_eq!(chains.stage_headers().length(), 8);
        assert_eq!(chains.snapshot_priority(), snapshot.priority);
    }

    #[test]
    fn rollback_resets_incompatible_stage() {
        let consensus = base_chain(5);
        let mut chains = StageAndConsensus::new(consensus.clone(), None);

        let mut candidate = consensus.clone();
        candidate.truncate(3);
        candidate.append(&extend(&candidate, 5, 9)).expect("stage");
        chains.update_stage(candidate);

        // pin a height inside the staged fork's replaced suffix
        let snapshot = SignedSnapshot {
            priority: SnapshotPriority {
                importance: 3,
                height: 4,
            },
            hash: consensus.hash_at(4).expect("hash"),
            signature: [1u8; SIGNATURE_LEN],
        };
        chains
            .update_consensus_rollback(&RollbackData {
                snapshot,
                shrink_length: 3,
            })
            .expect("shrank");
        assert_eq!(chains.consensus_length(), 3);
        assert_eq!(chains.stage_headers().length(), 3);
    }

    #[test]
    fn rollback_on_short_chain_returns_none() {
        let mut chains = StageAndConsensus::new(base_chain(2), None);
        let snapshot = SignedSnapshot {
            priority: SnapshotPriority {
                importance: 1,
                height: 7,
            },
            hash: [9u8; 32],
            signature: [0u8; SIGNATURE_LEN],
        };
        let info = chains.update_consensus_rollback(&RollbackData {
            snapshot,
            shrink_length: 7,
        });
        assert!(info.is_none());
        assert!(chains.signed_snapshot().is_some());
    }

    #[test]
    fn update_stage_reports_fork_height() {
        let mut chains = StageAndConsensus::new(base_chain(4), None);
        let mut candidate = chains.consensus_headers().clone();
        candidate.truncate(2);
        candidate.append(&extend(&candidate, 6, 5)).expect("alt");
        assert_eq!(chains.update_stage(candidate), 3);
    }
}
