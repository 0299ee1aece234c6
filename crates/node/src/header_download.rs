use std::collections::{BTreeMap, BTreeSet};

use basalt_chain::{HeaderChain, StageAndConsensus};
use basalt_pow::Worksum;
use basalt_primitives::{Header, Height};

use crate::error::{ErrorCode, Offender};
use crate::peer::{BatchRequest, PeerChainView};
use crate::registry::Registry;
use crate::sender::RequestSender;
use crate::wire::HEADER_BATCH_SIZE;

const PROMOTE_STRIDE: Height = HEADER_BATCH_SIZE;

// One chain being assembled: batches are fetched toward the leader's claim
// and verified by hash linkage as they become contiguous. Peers other than
// the leader may assist; a diverging assist batch is dropped (they may
// honestly sit on another fork), a diverging leader batch is an offense.
struct Assembly {
    leader: u64,
    leader_descriptor: u32,
    target_length: Height,
    target_worksum: Worksum,
    pending: HeaderChain,
    frontier: Height,
    fetched: BTreeMap<Height, (u64, Vec<Header>)>,
    inflight: BTreeMap<Height, (u64, u32)>,
    blocked: BTreeSet<u64>,
    promoted_length: Height,
}

// Coordinates header-batch fetching across peers toward the heaviest
// advertised fork above the current worksum target.
pub struct HeaderDownload {
    min_worksum: Worksum,
    members: BTreeSet<u64>,
    assembly: Option<Assembly>,
    complete: Option<HeaderChain>,
}

impl HeaderDownload {
    pub fn new(min_worksum: Worksum) -> Self {
        Self {
            min_worksum,
            members: BTreeSet::new(),
            assembly: None,
            complete: None,
        }
    }

    pub fn set_min_worksum(&mut self, worksum: Worksum) {
        self.min_worksum = worksum;
    }

    pub fn insert(&mut self, conn_id: u64) {
        self.members.insert(conn_id);
    }

    pub fn erase(&mut self, conn_id: u64) -> bool {
        let was_member = self.members.remove(&conn_id);
        if let Some(assembly) = &mut self.assembly {
            if assembly.leader == conn_id {
                self.assembly = None;
            } else {
                assembly.blocked.remove(&conn_id);
                let freed: Vec<Height> = assembly
                    .inflight
                    .iter()
                    .filter(|(_, &(peer, _))| peer == conn_id)
                    .map(|(&start, _)| start)
                    .collect();
                for start in freed {
                    assembly.inflight.remove(&start);
                    assembly.frontier = assembly.frontier.min(start);
                }
            }
        }
        was_member
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn pop_data(&mut self) -> Option<HeaderChain> {
        self.complete.take()
    }

    pub fn is_active(&self, registry: &Registry) -> bool {
        self.members.iter().any(|&id| {
            registry
                .get(id)
                .and_then(|peer| peer.chain.as_ref())
                .map(|chain| chain.view().worksum > self.min_worksum)
                .unwrap_or(false)
        })
    }

    // The leader's claim moved (same descriptor): raise the target.
    pub fn on_append(&mut self, conn_id: u64, view: &PeerChainView) {
        if let Some(assembly) = &mut self.assembly {
            if assembly.leader == conn_id && assembly.leader_descriptor == view.descriptor {
                assembly.target_length = view.length;
                assembly.target_worksum = view.worksum;
            }
        }
    }

    pub fn on_fork(&mut self, conn_id: u64, view: &PeerChainView) {
        if let Some(assembly) = &mut self.assembly {
            if assembly.leader == conn_id && assembly.leader_descriptor != view.descriptor {
                self.assembly = None;
            } else {
                assembly.blocked.remove(&conn_id);
            }
        }
    }

    pub fn on_rollback(&mut self, conn_id: u64, _view: &PeerChainView) {
        if let Some(assembly) = &mut self.assembly {
            if assembly.leader == conn_id {
                self.assembly = None;
            } else {
                assembly.blocked.remove(&conn_id);
            }
        }
    }

    // Our own consensus lost a suffix; the assembled prefix may be invalid.
    pub fn on_consensus_change(&mut self) {
        self.assembly = None;
    }

    pub fn on_signed_snapshot_update(&mut self) {
        self.assembly = None;
    }

    pub fn on_proberep(&mut self, _conn_id: u64) {}

    pub fn on_probe_request_expire(&mut self, _conn_id: u64) {}

    pub fn on_request_expire(&mut self, conn_id: u64, req: &BatchRequest) {
        if let Some(assembly) = &mut self.assembly {
            if let Some(&(peer, _)) = assembly.inflight.get(&req.start_height) {
                if peer == conn_id {
                    assembly.inflight.remove(&req.start_height);
                    assembly.frontier = assembly.frontier.min(req.start_height);
                }
            }
        }
    }

    fn leader_candidate(&self, registry: &Registry) -> Option<(u64, PeerChainView, Height)> {
        let mut best: Option<(u64, PeerChainView, Height)> = None;
        for &id in &self.members {
            let Some(peer) = registry.get(id) else {
                continue;
            };
            if peer.link.erased() {
                continue;
            }
            let Some(chain) = &peer.chain else {
                continue;
            };
            let view = *chain.view();
            if view.worksum <= self.min_worksum {
                continue;
            }
            if !chain.consensus_fork().settled() {
                continue;
            }
            // strictly heavier wins; ties keep the earlier-registered peer
            let heavier = match &best {
                Some((_, best_view, _)) => view.worksum > best_view.worksum,
                None => true,
            };
            if heavier {
                best = Some((id, view, chain.consensus_fork().lower()));
            }
        }
        best
    }

    fn ensure_assembly(
        &mut self,
        registry: &Registry,
        chains: &StageAndConsensus,
    ) -> Vec<Offender> {
        if let Some(assembly) = &self.assembly {
            if assembly.target_worksum > self.min_worksum {
                return Vec::new();
            }
            self.assembly = None;
        }
        let Some((leader, view, fork_start)) = self.leader_candidate(registry) else {
            return Vec::new();
        };
        if view.length + 1 < fork_start {
            // claimed length contradicts the settled fork point
            return vec![Offender {
                conn_id: leader,
                code: ErrorCode::ChainMismatch,
            }];
        }
        let prefix = chains.consensus_headers().get_headers(1, fork_start - 1);
        let pending = match HeaderChain::from_headers(prefix) {
            Ok(chain) => chain,
            Err(_) => return Vec::new(),
        };
        self.assembly = Some(Assembly {
            leader,
            leader_descriptor: view.descriptor,
            target_length: view.length,
            target_worksum: view.worksum,
            frontier: pending.length() + 1,
            promoted_length: pending.length(),
            pending,
            fetched: BTreeMap::new(),
            inflight: BTreeMap::new(),
            blocked: BTreeSet::new(),
        });
        Vec::new()
    }

    fn pick_batch_peer(
        &self,
        sender: &RequestSender<'_>,
        start: Height,
        length: u32,
    ) -> Option<(u64, u32)> {
        let assembly = self.assembly.as_ref()?;
        // the leader serves its own chain first
        let mut candidates = std::iter::once(assembly.leader)
            .chain(self.members.iter().copied().filter(|&id| id != assembly.leader));
        candidates.find_map(|id| {
            if assembly.blocked.contains(&id) || !sender.peer_idle(id) {
                return None;
            }
            let peer = sender.registry.get(id)?;
            let chain = peer.chain.as_ref()?;
            let view = chain.view();
            if view.worksum <= self.min_worksum || view.length < start + length - 1 {
                return None;
            }
            Some((id, view.descriptor))
        })
    }

    pub fn do_header_requests(
        &mut self,
        sender: &mut RequestSender<'_>,
        chains: &StageAndConsensus,
    ) -> Vec<Offender> {
        let offenders = self.ensure_assembly(sender.registry, chains);
        if !offenders.is_empty() {
            return offenders;
        }
        loop {
            if sender.finished() {
                return Vec::new();
            }
            let Some(assembly) = &self.assembly else {
                return Vec::new();
            };
            let start = assembly.frontier;
            if start > assembly.target_length {
                return Vec::new();
            }
            let length = HEADER_BATCH_SIZE.min(assembly.target_length - start + 1);
            let Some((peer, descriptor)) = self.pick_batch_peer(sender, start, length) else {
                return Vec::new();
            };
            if !sender.send_batch(peer, descriptor, start, length) {
                return Vec::new();
            }
            let assembly = self.assembly.as_mut().expect("assembly checked above");
            assembly.inflight.insert(start, (peer, length));
            assembly.frontier = start + length;
        }
    }

    pub fn do_probe_requests(
        &mut self,
        sender: &mut RequestSender<'_>,
        _chains: &StageAndConsensus,
    ) {
        for &id in self.members.iter() {
            if sender.finished() {
                return;
            }
            if !sender.peer_idle(id) {
                continue;
            }
            let Some(peer) = sender.registry.get(id) else {
                continue;
            };
            let Some(chain) = &peer.chain else {
                continue;
            };
            if chain.view().worksum <= self.min_worksum {
                continue;
            }
            let Some(height) = chain.consensus_fork().probe_height() else {
                continue;
            };
            let descriptor = chain.view().descriptor;
            sender.send_probe(id, descriptor, height);
        }
    }

    pub fn on_response(
        &mut self,
        conn_id: u64,
        req: BatchRequest,
        headers: Vec<Header>,
        _chains: &StageAndConsensus,
    ) -> Vec<Offender> {
        // internal linkage is an offense regardless of fork membership
        for pair in headers.windows(2) {
            if pair[1].prev_hash != pair[0].hash() {
                if let Some(assembly) = &mut self.assembly {
                    assembly.inflight.remove(&req.start_height);
                    assembly.frontier = assembly.frontier.min(req.start_height);
                }
                return vec![Offender {
                    conn_id,
                    code: ErrorCode::ChainMismatch,
                }];
            }
        }
        let mut offenders = Vec::new();
        let mut reset = false;
        let min_worksum = self.min_worksum;
        let Some(assembly) = self.assembly.as_mut() else {
            return offenders;
        };
        match assembly.inflight.get(&req.start_height) {
            Some(&(peer, _)) if peer == conn_id => {
                assembly.inflight.remove(&req.start_height);
            }
            _ => return offenders,
        }
        assembly.fetched.insert(req.start_height, (conn_id, headers));

        // drain whatever became contiguous
        loop {
            let next = assembly.pending.length() + 1;
            let Some((supplier, batch)) = assembly.fetched.remove(&next) else {
                break;
            };
            let first_links = batch
                .first()
                .map(|h| h.prev_hash == assembly.pending.tip_hash())
                .unwrap_or(false);
            if !first_links {
                if supplier == assembly.leader {
                    offenders.push(Offender {
                        conn_id: supplier,
                        code: ErrorCode::ChainMismatch,
                    });
                    reset = true;
                    break;
                }
                // honest fork divergence: drop and stop asking this peer
                assembly.blocked.insert(supplier);
                assembly.frontier = assembly.frontier.min(next);
                continue;
            }
            if assembly.pending.append(&batch).is_err() {
                // invalid target bits or broken link inside an accepted batch
                offenders.push(Offender {
                    conn_id: supplier,
                    code: ErrorCode::ChainMismatch,
                });
                reset = true;
                break;
            }
        }

        if !reset {
            // full claim fetched but lighter than advertised: the leader lied
            if assembly.pending.length() >= assembly.target_length
                && assembly.pending.total_work() < assembly.target_worksum
            {
                offenders.push(Offender {
                    conn_id: assembly.leader,
                    code: ErrorCode::ChainMismatch,
                });
                reset = true;
            } else if assembly.pending.total_work() > min_worksum
                && (assembly.pending.length() >= assembly.target_length
                    || assembly.pending.length() >= assembly.promoted_length + PROMOTE_STRIDE)
            {
                self.complete = Some(assembly.pending.clone());
                assembly.promoted_length = assembly.pending.length();
            }
        }
        if reset {
            self.assembly = None;
        }
        offenders
    }
}
