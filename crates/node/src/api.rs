use basalt_primitives::{Hash256, Height};
use serde::Serialize;

// Unified API DTOs. Callbacks fire exactly once, on the loop thread, with a
// snapshot of state.

pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotPriorityInfo {
    pub importance: u32,
    pub height: Height,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerChainInfo {
    pub descriptor: u32,
    pub length: Height,
    pub worksum: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    pub id: u64,
    pub address: String,
    pub inbound: bool,
    pub since: u64,
    pub initialized: bool,
    pub chain: Option<PeerChainInfo>,
    pub their_snapshot_priority: SnapshotPriorityInfo,
    pub acknowledged_snapshot_priority: SnapshotPriorityInfo,
    pub throttle: ThrottleState,
}

#[derive(Clone, Debug, Serialize)]
pub struct ThrottleState {
    pub queued: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct HashrateInfo {
    pub n_blocks: usize,
    pub estimate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HashrateChart {
    pub window: usize,
    pub points: Vec<(Height, f64)>,
}

pub fn peers_json(peers: &[PeerInfo]) -> String {
    serde_json::to_string(peers).unwrap_or_else(|_| "[]".to_string())
}

pub type PeersCb = Box<dyn FnOnce(Vec<PeerInfo>) + Send>;
pub type SyncedCb = Box<dyn FnOnce(bool) + Send>;
pub type HashrateCb = Box<dyn FnOnce(HashrateInfo) + Send>;
pub type HashrateChartCb = Box<dyn FnOnce(HashrateChart) + Send>;
