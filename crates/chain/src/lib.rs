//! In-memory header chains, fork tracking and the stage/consensus cache.

pub mod cache;
pub mod fork_range;
pub mod header_chain;
pub mod snapshot;
pub mod updates;

pub use cache::{AppendInfo, ForkInfo, RollbackInfo, StageAndConsensus};
pub use fork_range::{ChainError, ForkRange};
pub use header_chain::{HeaderChain, HeaderChainError, GENESIS_HASH};
pub use snapshot::{SignedSnapshot, SnapshotPriority, SIGNATURE_LEN};
pub use updates::{Append, ChainstateUpdate, Fork, RollbackData};
