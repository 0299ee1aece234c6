use std::collections::{BTreeMap, BTreeSet};

use basalt_chain::HeaderChain;
use basalt_pow::Worksum;
use basalt_primitives::Height;

use crate::error::{ErrorCode, Offender};
use crate::peer::BlockRequest;
use crate::sender::RequestSender;
use crate::wire::BlockrepMsg;

const BLOCK_BATCH: u32 = 8;
const STAGE_CHUNK: u32 = 64;
const FETCH_AHEAD: Height = 512;

struct Stage {
    chain: HeaderChain,
    // first height whose body the consensus chain lacks
    staged_next: Height,
    bodies: BTreeMap<Height, (u64, basalt_primitives::BodyContainer)>,
    inflight: BTreeMap<Height, (u64, BlockRequest)>,
    // suppliers of the chunk currently being validated, by offset
    pending_stage: Option<(Height, Vec<u64>)>,
    applied_until: Height,
}

// Fetches block bodies for the promoted stage chain in ordered ranges and
// feeds contiguous chunks to the chain server for validation.
pub struct BlockDownload {
    min_worksum: Worksum,
    members: BTreeSet<u64>,
    stage: Option<Stage>,
}

impl BlockDownload {
    pub fn new(min_worksum: Worksum) -> Self {
        Self {
            min_worksum,
            members: BTreeSet::new(),
            stage: None,
        }
    }

    pub fn set_min_worksum(&mut self, worksum: Worksum) {
        self.min_worksum = worksum;
        if let Some(stage) = &self.stage {
            if stage.chain.total_work() <= worksum {
                // consensus caught up with (or passed) the staged chain
                self.stage = None;
            }
        }
    }

    pub fn insert(&mut self, conn_id: u64) {
        self.members.insert(conn_id);
    }

    pub fn erase(&mut self, conn_id: u64) -> bool {
        let was_member = self.members.remove(&conn_id);
        if let Some(stage) = &mut self.stage {
            let freed: Vec<Height> = stage
                .inflight
                .iter()
                .filter(|(_, &(peer, _))| peer == conn_id)
                .map(|(&lower, _)| lower)
                .collect();
            for lower in freed {
                stage.inflight.remove(&lower);
            }
        }
        was_member
    }

    pub fn is_active(&self) -> bool {
        self.stage.is_some()
    }

    pub fn reset(&mut self) {
        self.stage = None;
    }

    // An authoritative snapshot that contradicts the staged chain voids the
    // whole download.
    pub fn reset_if_incompatible(&mut self, snapshot: &basalt_chain::SignedSnapshot) {
        if let Some(stage) = &self.stage {
            if !snapshot.compatible(&stage.chain) {
                self.stage = None;
            }
        }
    }

    pub fn get_reachable_totalwork(&self) -> Worksum {
        match &self.stage {
            Some(stage) => stage.chain.total_work().max(self.min_worksum),
            None => self.min_worksum,
        }
    }

    // Adopt a freshly promoted header chain. Bodies already fetched for an
    // identical prefix carry over.
    pub fn init(&mut self, chain: HeaderChain, fork_height: Height) -> Vec<Offender> {
        if chain.total_work() <= self.min_worksum {
            return Vec::new();
        }
        let mut bodies = BTreeMap::new();
        let mut staged_next = fork_height;
        let mut applied_until = fork_height.saturating_sub(1);
        if let Some(old) = self.stage.take() {
            if old.chain.fork_height(&chain) > old.applied_until {
                // prior progress is on the same branch
                applied_until = applied_until.max(old.applied_until);
                staged_next = staged_next.max(old.staged_next);
                for (height, entry) in old.bodies {
                    if old.chain.hash_at(height) == chain.hash_at(height) {
                        bodies.insert(height, entry);
                    }
                }
            }
        }
        self.stage = Some(Stage {
            chain,
            staged_next,
            bodies,
            inflight: BTreeMap::new(),
            pending_stage: None,
            applied_until,
        });
        Vec::new()
    }

    pub fn on_append(&mut self, _conn_id: u64) {}

    pub fn on_fork(&mut self, _conn_id: u64) {}

    pub fn on_rollback(&mut self, _conn_id: u64) {}

    pub fn on_blockreq_expire(&mut self, conn_id: u64) {
        if let Some(stage) = &mut self.stage {
            let freed: Vec<Height> = stage
                .inflight
                .iter()
                .filter(|(_, &(peer, _))| peer == conn_id)
                .map(|(&lower, _)| lower)
                .collect();
            for lower in freed {
                stage.inflight.remove(&lower);
            }
        }
    }

    fn covered(stage: &Stage, height: Height) -> bool {
        if stage.bodies.contains_key(&height) {
            return true;
        }
        stage
            .inflight
            .values()
            .any(|(_, req)| req.lower <= height && height <= req.upper)
    }

    fn next_range(stage: &Stage) -> Option<(Height, Height)> {
        let len = stage.chain.length();
        let horizon = stage.staged_next.saturating_add(FETCH_AHEAD).min(len);
        let mut lower = stage.staged_next;
        while lower <= horizon {
            if !Self::covered(stage, lower) {
                break;
            }
            lower += 1;
        }
        if lower > horizon {
            return None;
        }
        let mut upper = lower;
        while upper < horizon && upper - lower + 1 < BLOCK_BATCH && !Self::covered(stage, upper + 1)
        {
            upper += 1;
        }
        Some((lower, upper))
    }

    pub fn do_block_requests(&mut self, sender: &mut RequestSender<'_>) {
        loop {
            if sender.finished() {
                return;
            }
            let Some(stage) = &self.stage else {
                return;
            };
            let Some((lower, upper)) = Self::next_range(stage) else {
                return;
            };
            // any member whose advertised chain reaches the range may serve
            // it; bodies are checked against the stage headers on arrival
            let peer = self.members.iter().copied().find(|&id| {
                if !sender.peer_idle(id) {
                    return false;
                }
                sender
                    .registry
                    .get(id)
                    .and_then(|peer| peer.chain.as_ref())
                    .map(|chain| chain.view().length >= upper)
                    .unwrap_or(false)
            });
            let Some(peer) = peer else {
                return;
            };
            if !sender.send_block(peer, lower, upper) {
                return;
            }
            let nonce = match sender.registry.get(peer).map(|p| p.job.data()) {
                Some(crate::peer::JobData::Block(req)) => req.nonce,
                _ => 0,
            };
            let stage = self.stage.as_mut().expect("stage checked above");
            stage.inflight.insert(
                lower,
                (
                    peer,
                    BlockRequest {
                        nonce,
                        lower,
                        upper,
                    },
                ),
            );
        }
    }

    pub fn on_blockreq_reply(
        &mut self,
        conn_id: u64,
        rep: BlockrepMsg,
        req: BlockRequest,
    ) -> Result<(), ErrorCode> {
        let Some(stage) = &mut self.stage else {
            return Ok(());
        };
        match stage.inflight.get(&req.lower) {
            Some(&(peer, _)) if peer == conn_id => {
                stage.inflight.remove(&req.lower);
            }
            _ => return Ok(()),
        }
        if rep.bodies.len() != req.count() as usize {
            return Err(ErrorCode::BlockRange);
        }
        for (offset, body) in rep.bodies.into_iter().enumerate() {
            let height = req.lower + offset as Height;
            stage.bodies.insert(height, (conn_id, body));
        }
        Ok(())
    }

    // Surface the next contiguous chunk ready for validation. At most one
    // stage request is outstanding at a time.
    pub fn pop_stage(&mut self) -> Option<crate::interfaces::StageRequest> {
        let stage = self.stage.as_mut()?;
        if stage.pending_stage.is_some() {
            return None;
        }
        let lower = stage.staged_next;
        let mut headers = Vec::new();
        let mut bodies = Vec::new();
        let mut suppliers = Vec::new();
        let mut height = lower;
        while height <= stage.chain.length() && (height - lower) < STAGE_CHUNK {
            let Some((supplier, body)) = stage.bodies.remove(&height) else {
                break;
            };
            let header = *stage.chain.get_header(height)?;
            headers.push(header);
            bodies.push(body);
            suppliers.push(supplier);
            height += 1;
        }
        if headers.is_empty() {
            return None;
        }
        stage.staged_next = height;
        stage.pending_stage = Some((lower, suppliers));
        Some(crate::interfaces::StageRequest {
            lower,
            headers,
            bodies,
        })
    }

    pub fn on_stage_result(&mut self, result: crate::interfaces::StageResult) -> Vec<Offender> {
        let Some(stage) = &mut self.stage else {
            return Vec::new();
        };
        let Some((lower, suppliers)) = stage.pending_stage.take() else {
            return Vec::new();
        };
        match result {
            crate::interfaces::StageResult::Applied { until } => {
                stage.applied_until = stage.applied_until.max(until);
                if stage.applied_until >= stage.chain.length() {
                    self.stage = None;
                }
                Vec::new()
            }
            crate::interfaces::StageResult::Rejected { height } => {
                let offender = height
                    .checked_sub(lower)
                    .and_then(|offset| suppliers.get(offset as usize))
                    .map(|&conn_id| Offender {
                        conn_id,
                        code: ErrorCode::BodyParse,
                    });
                // refetch from the rejected height
                stage.staged_next = height;
                let tail: Vec<Height> = stage
                    .bodies
                    .range(height..)
                    .map(|(&h, _)| h)
                    .collect();
                for h in tail {
                    stage.bodies.remove(&h);
                }
                offender.into_iter().collect()
            }
        }
    }
}
