use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_chain::{ChainError, ForkRange, StageAndConsensus};
use basalt_pow::Worksum;
use basalt_primitives::Height;

use crate::error::ErrorCode;
use crate::timer::{Timer, TimerEvent, TimerKey};
use crate::transport::{Link, Sndbuffer};
use crate::wire::{AppendMsg, ForkMsg, InitMsg, ProberepMsg, SignedPinRollbackMsg};
use basalt_chain::SnapshotPriority;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProbeRequest {
    pub nonce: u64,
    pub descriptor: u32,
    pub height: Height,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchRequest {
    pub nonce: u64,
    pub descriptor: u32,
    pub start_height: Height,
    pub length: u32,
    pub min_return: u32,
    pub max_return: u32,
}

impl BatchRequest {
    pub fn end(&self) -> Height {
        self.start_height + self.length - 1
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRequest {
    pub nonce: u64,
    pub lower: Height,
    pub upper: Height,
}

impl BlockRequest {
    pub fn count(&self) -> u32 {
        self.upper - self.lower + 1
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobData {
    AwaitInit,
    Idle,
    Probe(ProbeRequest),
    Batch(BatchRequest),
    Block(BlockRequest),
}

// At most one outstanding request per peer. `counted` tracks whether the
// job currently occupies an active-request slot.
#[derive(Debug)]
pub struct Job {
    data: JobData,
    timer: Option<TimerKey>,
    counted: bool,
}

impl Job {
    pub fn awaiting_init(init_timer: TimerKey) -> Self {
        Self {
            data: JobData::AwaitInit,
            timer: Some(init_timer),
            counted: false,
        }
    }

    pub fn data(&self) -> &JobData {
        &self.data
    }

    pub fn is_awaiting_init(&self) -> bool {
        matches!(self.data, JobData::AwaitInit)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.data, JobData::Idle)
    }

    pub fn has_outstanding(&self) -> bool {
        matches!(
            self.data,
            JobData::Probe(_) | JobData::Batch(_) | JobData::Block(_)
        )
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }

    pub fn timer_key(&self) -> Option<TimerKey> {
        self.timer
    }

    pub fn on_init_received(&mut self, timer: &mut Timer) {
        if let Some(key) = self.timer.take() {
            timer.cancel(key);
        }
        self.data = JobData::Idle;
    }

    pub fn assign(&mut self, data: JobData, expiry: TimerKey, active_requests: &mut usize) {
        debug_assert!(self.is_idle());
        self.data = data;
        self.timer = Some(expiry);
        self.counted = true;
        *active_requests += 1;
    }

    fn close(&mut self, timer: &mut Timer, active_requests: &mut usize) {
        if let Some(key) = self.timer.take() {
            timer.cancel(key);
        }
        if self.counted {
            self.counted = false;
            *active_requests -= 1;
        }
        self.data = JobData::Idle;
    }

    pub fn pop_probe(
        &mut self,
        nonce: u64,
        timer: &mut Timer,
        active_requests: &mut usize,
    ) -> Result<ProbeRequest, ErrorCode> {
        match self.data {
            JobData::Probe(req) if req.nonce == nonce => {
                self.close(timer, active_requests);
                Ok(req)
            }
            _ => Err(ErrorCode::Unsolicited),
        }
    }

    pub fn pop_batch(
        &mut self,
        nonce: u64,
        timer: &mut Timer,
        active_requests: &mut usize,
    ) -> Result<BatchRequest, ErrorCode> {
        match self.data {
            JobData::Batch(req) if req.nonce == nonce => {
                self.close(timer, active_requests);
                Ok(req)
            }
            _ => Err(ErrorCode::Unsolicited),
        }
    }

    pub fn pop_block(
        &mut self,
        nonce: u64,
        timer: &mut Timer,
        active_requests: &mut usize,
    ) -> Result<BlockRequest, ErrorCode> {
        match self.data {
            JobData::Block(req) if req.nonce == nonce => {
                self.close(timer, active_requests);
                Ok(req)
            }
            _ => Err(ErrorCode::Unsolicited),
        }
    }

    // The request stays assigned (a late reply may still match) but frees
    // its active slot; the caller installs the close-no-reply timer.
    pub fn expire(&mut self, close_timer: TimerKey, active_requests: &mut usize) -> JobData {
        self.timer = Some(close_timer);
        if self.counted {
            self.counted = false;
            *active_requests -= 1;
        }
        self.data
    }

    pub fn unref_active_requests(&mut self, active_requests: &mut usize) {
        if self.counted {
            self.counted = false;
            *active_requests -= 1;
        }
    }
}

#[derive(Debug)]
pub enum PingState {
    Idle,
    AwaitPong {
        nonce: u64,
        sent_priority: SnapshotPriority,
        timer: TimerKey,
    },
    Sleeping {
        timer: TimerKey,
    },
}

impl PingState {
    pub fn timer_key(&self) -> Option<TimerKey> {
        match self {
            PingState::Idle => None,
            PingState::AwaitPong { timer, .. } => Some(*timer),
            PingState::Sleeping { timer } => Some(*timer),
        }
    }

    pub fn await_pong(&mut self, nonce: u64, sent_priority: SnapshotPriority, timer: TimerKey) {
        *self = PingState::AwaitPong {
            nonce,
            sent_priority,
            timer,
        };
    }

    // Accept a pong only while one is awaited and the nonce matches; returns
    // the priority carried by the ping so acknowledgements stay monotone.
    pub fn check(&self, nonce: u64) -> Result<SnapshotPriority, ErrorCode> {
        match self {
            PingState::AwaitPong {
                nonce: expected,
                sent_priority,
                ..
            } if *expected == nonce => Ok(*sent_priority),
            _ => Err(ErrorCode::Unsolicited),
        }
    }

    pub fn sleep(&mut self, timer: TimerKey) -> Option<TimerKey> {
        let old = self.timer_key();
        *self = PingState::Sleeping { timer };
        old
    }

    pub fn on_timer_fired(&mut self) {
        *self = PingState::Idle;
    }
}

// Outbound buffers gated by a minimum send gap. One buffer drains per
// ThrottledSend firing.
#[derive(Debug, Default)]
pub struct Throttled {
    queue: VecDeque<(Instant, Sndbuffer)>,
    timer: Option<TimerKey>,
    next_free: Option<Instant>,
}

impl Throttled {
    pub fn insert(
        &mut self,
        buffer: Sndbuffer,
        gap: Duration,
        now: Instant,
        timer: &mut Timer,
        conn_id: u64,
    ) {
        let at = self.next_free.filter(|t| *t > now).unwrap_or(now);
        self.queue.push_back((at, buffer));
        self.next_free = Some(at + gap);
        if self.timer.is_none() {
            self.timer = Some(timer.insert(at, TimerEvent::ThrottledSend { conn_id }));
        }
    }

    pub fn on_fire(&mut self, now: Instant, timer: &mut Timer, conn_id: u64) -> Option<Sndbuffer> {
        self.timer = None;
        let (_, buffer) = self.queue.pop_front()?;
        if let Some(&(at, _)) = self.queue.front() {
            self.timer = Some(timer.insert(at.max(now), TimerEvent::ThrottledSend { conn_id }));
        }
        Some(buffer)
    }

    pub fn timer_key(&self) -> Option<TimerKey> {
        self.timer
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerChainView {
    pub descriptor: u32,
    pub length: Height,
    pub worksum: Worksum,
}

// Our record of a peer's advertised chain, plus the height intervals where
// it may fork from our consensus and stage chains.
#[derive(Clone, Debug)]
pub struct PeerChain {
    view: PeerChainView,
    consensus_fork: ForkRange,
    stage_fork: ForkRange,
}

impl PeerChain {
    pub fn new(init: &InitMsg, chains: &StageAndConsensus) -> Self {
        let view = PeerChainView {
            descriptor: init.descriptor,
            length: init.chain_length,
            worksum: init.worksum,
        };
        let consensus_fork =
            ForkRange::new(1, chains.consensus_length().min(view.length) + 1);
        let stage_fork =
            ForkRange::new(1, chains.stage_headers().length().min(view.length) + 1);
        Self {
            view,
            consensus_fork,
            stage_fork,
        }
    }

    pub fn view(&self) -> &PeerChainView {
        &self.view
    }

    pub fn consensus_fork(&self) -> &ForkRange {
        &self.consensus_fork
    }

    pub fn stage_fork(&self) -> &ForkRange {
        &self.stage_fork
    }

    fn update_len_bounds(&mut self, chains: &StageAndConsensus) {
        self.consensus_fork
            .set_len_bound(chains.consensus_length().min(self.view.length) + 1);
        self.stage_fork
            .set_len_bound(chains.stage_headers().length().min(self.view.length) + 1);
    }

    pub fn on_peer_append(
        &mut self,
        m: &AppendMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if m.new_length <= self.view.length || m.worksum <= self.view.worksum {
            return Err(ChainError::NonMonotonicAppend);
        }
        self.view.length = m.new_length;
        self.view.worksum = m.worksum;
        self.update_len_bounds(chains);
        Ok(())
    }

    pub fn on_peer_fork(
        &mut self,
        m: &ForkMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if m.descriptor <= self.view.descriptor || m.worksum <= self.view.worksum {
            return Err(ChainError::NonMonotonicAppend);
        }
        if m.fork_height == 0 || m.fork_height > self.view.length {
            return Err(ChainError::NonMonotonicAppend);
        }
        self.view.descriptor = m.descriptor;
        self.view.length = m.new_length;
        self.view.worksum = m.worksum;
        self.consensus_fork.reorg(m.fork_height);
        self.stage_fork.reorg(m.fork_height);
        self.update_len_bounds(chains);
        Ok(())
    }

    pub fn on_peer_shrink(
        &mut self,
        m: &SignedPinRollbackMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        if m.shrink_length >= self.view.length {
            return Err(ChainError::BadShrink);
        }
        self.view.descriptor = m.descriptor;
        self.view.length = m.shrink_length;
        self.view.worksum = m.worksum;
        self.consensus_fork.reorg(m.shrink_length + 1);
        self.stage_fork.reorg(m.shrink_length + 1);
        self.update_len_bounds(chains);
        Ok(())
    }

    pub fn on_consensus_append(&mut self, chains: &StageAndConsensus) {
        self.update_len_bounds(chains);
    }

    pub fn on_consensus_fork(&mut self, fork_height: Height, chains: &StageAndConsensus) {
        self.consensus_fork.reorg(fork_height);
        self.update_len_bounds(chains);
    }

    pub fn on_consensus_shrink(&mut self, chains: &StageAndConsensus) {
        self.consensus_fork.reorg(chains.consensus_length() + 1);
        self.update_len_bounds(chains);
    }

    pub fn on_stage_update(&mut self, fork_height: Height, chains: &StageAndConsensus) {
        let lower = self.consensus_fork.lower().min(fork_height);
        let upper = chains.stage_headers().length().min(self.view.length) + 1;
        self.stage_fork = ForkRange::new(lower, upper);
    }

    // Narrow the consensus fork range from a probe answer. Stale answers
    // (the range moved past the probed height meanwhile) are ignored.
    pub fn on_proberep(
        &mut self,
        req: &ProbeRequest,
        rep: &ProberepMsg,
        chains: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        let Some(requested) = rep.requested else {
            return Ok(());
        };
        let height = req.height;
        if height < self.consensus_fork.lower() || height >= self.consensus_fork.upper() {
            return Ok(());
        }
        match chains.consensus_headers().hash_at(height) {
            Some(ours) if ours == requested.hash() => self.consensus_fork.on_match(height),
            Some(_) => self.consensus_fork.on_mismatch(height),
            None => Ok(()),
        }
    }
}

// Everything the loop tracks per connection.
pub struct PeerState {
    pub link: Arc<Link>,
    pub job: Job,
    pub ping: PingState,
    pub throttled: Throttled,
    pub chain: Option<PeerChain>,
    pub their_snapshot_priority: SnapshotPriority,
    pub acknowledged_snapshot_priority: SnapshotPriority,
    pub last_nonce: u64,
    pub last_ping_recv: Option<Instant>,
    pub tx_subscription: Height,
}

impl PeerState {
    pub fn new(link: Arc<Link>, init_timer: TimerKey) -> Self {
        Self {
            link,
            job: Job::awaiting_init(init_timer),
            ping: PingState::Idle,
            throttled: Throttled::default(),
            chain: None,
            their_snapshot_priority: SnapshotPriority::default(),
            acknowledged_snapshot_priority: SnapshotPriority::default(),
            last_nonce: 0,
            last_ping_recv: None,
            tx_subscription: 0,
        }
    }

    pub fn initialized(&self) -> bool {
        self.chain.is_some()
    }

    pub fn send(&self, buffer: Sndbuffer) {
        self.link.send(buffer);
    }
}
