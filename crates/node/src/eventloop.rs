use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use basalt_chain::{Append, ChainstateUpdate, Fork, RollbackData, StageAndConsensus};
use basalt_pow::worksum_to_f64;
use basalt_primitives::{BodyContainer, Height};
use rand::RngCore;

use crate::api::{
    HashrateCb, HashrateChart, HashrateChartCb, HashrateInfo, PeerChainInfo, PeerInfo, PeersCb,
    SnapshotPriorityInfo, SyncedCb, ThrottleState,
};
use crate::block_download::BlockDownload;
use crate::config::NodeConfig;
use crate::error::{close_reason_name, ErrorCode, Offender};
use crate::header_download::HeaderDownload;
use crate::interfaces::{
    BatchSelector, BlockRange, ChainServer, Dialer, PeerDb, StageResult, StateUpdate,
};
use crate::mempool::{self, MempoolCache};
use crate::peer::JobData;
use crate::peer::PeerChain;
use crate::registry::{DialPlanner, Registry};
use crate::sender::RequestSender;
use crate::sync_state::SyncState;
use crate::timer::{Timer, TimerEvent, TimerKey};
use crate::transport::Link;
use crate::wire::{
    AppendMsg, BatchreqMsg, BatchrepMsg, BlockreqMsg, BlockrepMsg, ForkMsg, InitMsg, LeaderMsg,
    Message, PingMsg, PongMsg, ProbereqMsg, ProberepMsg, Rcvbuffer, SignedPinRollbackMsg,
    TxnotifyMsg, TxreqMsg, TxrepMsg, MAX_BATCH_HEADERS, MAX_BODIES,
};

const PING_MAX_ADDRESSES: u16 = 32;
const PING_MAX_TRANSACTIONS: u16 = 256;
const SHUTDOWN_REASON: i32 = 1;

pub type InspectorCb = Box<dyn FnOnce(&Inspector) + Send>;

// Everything external threads can hand to the loop.
pub enum Event {
    Process(Arc<Link>),
    Release { link: Arc<Link>, error: i32 },
    State(StateUpdate),
    MempoolLog(mempool::Log),
    StageAction(StageResult),
    ForwardBlockrep { conn_id: u64, bodies: Vec<BodyContainer> },
    FailedOutbound(SocketAddr),
    Pin(SocketAddr),
    Unpin(SocketAddr),
    GetPeers { cb: PeersCb, filter_throttled: bool },
    GetSynced(SyncedCb),
    GetHashrate { cb: HashrateCb, n: usize },
    GetHashrateChart { cb: HashrateChartCb, from: Height, to: Height, window: usize },
    Inspect(InspectorCb),
}

struct Queue {
    events: VecDeque<Event>,
    has_work: bool,
    close_reason: i32,
}

struct Shared {
    queue: Mutex<Queue>,
    cv: Condvar,
}

// Cloneable producer side; all methods enqueue and return immediately.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub fn enqueue(&self, event: Event) -> bool {
        let mut queue = self.shared.queue.lock().expect("event queue mutex");
        if queue.close_reason != 0 {
            return false;
        }
        queue.has_work = true;
        queue.events.push_back(event);
        self.shared.cv.notify_one();
        true
    }

    pub fn async_process(&self, link: Arc<Link>) -> bool {
        self.enqueue(Event::Process(link))
    }

    pub fn async_erase(&self, link: Arc<Link>, error: i32) {
        let _ = self.enqueue(Event::Release { link, error });
    }

    pub fn async_state_update(&self, update: StateUpdate) {
        let _ = self.enqueue(Event::State(update));
    }

    pub fn async_mempool_update(&self, log: mempool::Log) {
        let _ = self.enqueue(Event::MempoolLog(log));
    }

    pub fn async_stage_action(&self, result: StageResult) {
        let _ = self.enqueue(Event::StageAction(result));
    }

    pub fn async_forward_blockrep(&self, conn_id: u64, bodies: Vec<BodyContainer>) {
        let _ = self.enqueue(Event::ForwardBlockrep { conn_id, bodies });
    }

    pub fn async_report_failed_outbound(&self, addr: SocketAddr) {
        let _ = self.enqueue(Event::FailedOutbound(addr));
    }

    pub fn async_shutdown(&self, reason: i32) {
        let mut queue = self.shared.queue.lock().expect("event queue mutex");
        queue.has_work = true;
        queue.close_reason = reason;
        self.shared.cv.notify_one();
    }

    pub fn api_pin(&self, addr: SocketAddr) {
        let _ = self.enqueue(Event::Pin(addr));
    }

    pub fn api_unpin(&self, addr: SocketAddr) {
        let _ = self.enqueue(Event::Unpin(addr));
    }

    pub fn api_get_peers(&self, cb: PeersCb, filter_throttled: bool) {
        let _ = self.enqueue(Event::GetPeers {
            cb,
            filter_throttled,
        });
    }

    pub fn api_get_synced(&self, cb: SyncedCb) {
        let _ = self.enqueue(Event::GetSynced(cb));
    }

    pub fn api_get_hashrate(&self, cb: HashrateCb, n: usize) {
        let _ = self.enqueue(Event::GetHashrate { cb, n });
    }

    pub fn api_get_hashrate_chart(
        &self,
        from: Height,
        to: Height,
        window: usize,
        cb: HashrateChartCb,
    ) {
        let _ = self.enqueue(Event::GetHashrateChart {
            cb,
            from,
            to,
            window,
        });
    }

    pub fn api_inspect(&self, cb: InspectorCb) {
        let _ = self.enqueue(Event::Inspect(cb));
    }
}

// Read-only view of loop internals, handed to inspect callbacks on the loop
// thread.
pub struct Inspector<'a> {
    inner: &'a Inner,
}

impl Inspector<'_> {
    pub fn active_requests(&self) -> usize {
        self.inner.active_requests
    }

    pub fn max_requests(&self) -> usize {
        self.inner.config.max_requests
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn initialized_peer_count(&self) -> usize {
        self.inner.registry.initialized_len()
    }

    pub fn outstanding_job_count(&self) -> usize {
        self.inner
            .registry
            .ids()
            .into_iter()
            .filter(|&id| {
                self.inner
                    .registry
                    .get(id)
                    .map(|peer| peer.job.has_outstanding())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn peer_exists(&self, conn_id: u64) -> bool {
        self.inner
            .registry
            .get(conn_id)
            .map(|peer| !peer.link.erased())
            .unwrap_or(false)
    }

    pub fn peer_initialized(&self, conn_id: u64) -> bool {
        self.inner
            .registry
            .get(conn_id)
            .map(|peer| peer.initialized() && !peer.link.erased())
            .unwrap_or(false)
    }

    pub fn peer_has_outstanding_job(&self, conn_id: u64) -> bool {
        self.inner
            .registry
            .get(conn_id)
            .map(|peer| peer.job.has_outstanding())
            .unwrap_or(false)
    }

    pub fn peer_snapshot_priorities(&self, conn_id: u64) -> Option<((u32, u32), (u32, u32))> {
        self.inner.registry.get(conn_id).map(|peer| {
            (
                (
                    peer.their_snapshot_priority.importance,
                    peer.their_snapshot_priority.height,
                ),
                (
                    peer.acknowledged_snapshot_priority.importance,
                    peer.acknowledged_snapshot_priority.height,
                ),
            )
        })
    }

    pub fn consensus_length(&self) -> Height {
        self.inner.chains.consensus_length()
    }

    pub fn stage_length(&self) -> Height {
        self.inner.chains.stage_headers().length()
    }

    pub fn consensus_work(&self) -> f64 {
        worksum_to_f64(self.inner.chains.consensus_work())
    }

    pub fn header_download_active(&self) -> bool {
        self.inner.header_download.is_active(&self.inner.registry)
    }

    pub fn block_download_active(&self) -> bool {
        self.inner.block_download.is_active()
    }

    pub fn synced(&self) -> bool {
        self.inner.sync_state.synced()
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.mempool.len()
    }
}

struct Inner {
    config: NodeConfig,
    chain_server: Box<dyn ChainServer>,
    peer_db: Box<dyn PeerDb>,
    dialer: Box<dyn Dialer>,
    handle: Handle,
    chains: StageAndConsensus,
    mempool: MempoolCache,
    registry: Registry,
    dial_planner: DialPlanner,
    timer: Timer,
    wakeup_timer: Option<TimerKey>,
    active_requests: usize,
    header_download: HeaderDownload,
    block_download: BlockDownload,
    sync_state: SyncState,
    shutting_down: bool,
}

// The peer event loop. One worker thread owns all mutable state; external
// threads talk to it through the cloneable Handle.
pub struct Eventloop {
    handle: Handle,
    worker: Option<JoinHandle<()>>,
}

impl Eventloop {
    pub fn spawn(
        chain_server: Box<dyn ChainServer>,
        peer_db: Box<dyn PeerDb>,
        dialer: Box<dyn Dialer>,
        config: NodeConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                events: VecDeque::new(),
                has_work: false,
                close_reason: 0,
            }),
            cv: Condvar::new(),
        });
        let handle = Handle {
            shared: Arc::clone(&shared),
        };
        let chains = chain_server.get_chainstate();
        let consensus_work = chains.consensus_work();
        let inner = Inner {
            dial_planner: DialPlanner::new(
                &config.connect,
                config.dial_backoff_start(),
                config.dial_backoff_cap(),
                Instant::now(),
            ),
            header_download: HeaderDownload::new(consensus_work),
            block_download: BlockDownload::new(consensus_work),
            chain_server,
            peer_db,
            dialer,
            handle: handle.clone(),
            chains,
            mempool: MempoolCache::new(),
            registry: Registry::new(),
            timer: Timer::new(),
            wakeup_timer: None,
            active_requests: 0,
            sync_state: SyncState::default(),
            shutting_down: false,
            config,
        };
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("eventloop".to_string())
            .spawn(move || run(inner, worker_shared))
            .expect("spawn event loop thread");
        Self {
            handle,
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn shutdown_join(mut self, reason: i32) {
        self.handle.async_shutdown(reason);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Eventloop {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.handle.async_shutdown(SHUTDOWN_REASON);
            let _ = worker.join();
        }
    }
}

fn run(mut inner: Inner, shared: Arc<Shared>) {
    inner.startup();
    loop {
        let events = {
            let mut queue = shared.queue.lock().expect("event queue mutex");
            loop {
                if queue.has_work || queue.close_reason != 0 {
                    break;
                }
                match inner.timer.next() {
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline <= now {
                            break;
                        }
                        let (guard, _) = shared
                            .cv
                            .wait_timeout(queue, deadline - now)
                            .expect("event queue mutex");
                        queue = guard;
                        let timer_due = inner
                            .timer
                            .next()
                            .map(|d| d <= Instant::now())
                            .unwrap_or(false);
                        if timer_due {
                            break;
                        }
                    }
                    None => {
                        queue = shared.cv.wait(queue).expect("event queue mutex");
                    }
                }
            }
            queue.has_work = false;
            std::mem::take(&mut queue.events)
        };
        inner.work(events);
        let close_reason = shared.queue.lock().expect("event queue mutex").close_reason;
        if close_reason != 0 {
            inner.shutdown(close_reason);
            return;
        }
    }
}

impl Inner {
    fn startup(&mut self) {
        log_info!(
            "Chain info: length {}, work {}",
            self.chains.consensus_length(),
            worksum_to_f64(self.chains.consensus_work())
        );
        match self.chains.signed_snapshot() {
            Some(snapshot) => {
                let valid = snapshot.compatible(self.chains.consensus_headers());
                log_info!(
                    "Chain snapshot is {}: priority {}, height {}",
                    if valid { "valid" } else { "invalid" },
                    snapshot.priority.importance,
                    snapshot.height()
                );
            }
            None => log_info!("Chain snapshot not present"),
        }
        self.update_wakeup();
        self.connect_scheduled();
    }

    fn work(&mut self, events: VecDeque<Event>) {
        let expired = self.timer.pop_expired(Instant::now());
        for event in expired {
            self.handle_timeout(event);
        }
        for event in events {
            self.handle_event(event);
        }
        self.registry.garbage_collect();
        self.update_sync_state();
    }

    fn shutdown(&mut self, reason: i32) {
        self.shutting_down = true;
        log_debug!("Shutdown, {} connections", self.registry.len());
        for id in self.registry.ids() {
            if let Some(peer) = self.registry.get(id) {
                if peer.link.erased() {
                    continue;
                }
                peer.link.conn().async_close(reason);
            }
            self.erase(id, reason);
        }
        self.registry.garbage_collect();
        self.chain_server.shutdown_join();
    }

    ////////////////////////
    // event dispatch

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Process(link) => self.process_connection(link),
            Event::Release { link, error } => {
                if !link.erased() && link.registered() {
                    self.erase(link.id(), error);
                }
            }
            Event::State(update) => {
                self.mempool.apply_log(&update.mempool_log);
                match update.chainstate {
                    ChainstateUpdate::Append(append) => self.update_chain_append(append),
                    ChainstateUpdate::Fork(fork) => self.update_chain_fork(fork),
                    ChainstateUpdate::Rollback(rollback) => self.update_chain_rollback(rollback),
                }
            }
            Event::MempoolLog(log) => self.handle_mempool_log(log),
            Event::StageAction(result) => {
                let offenders = self.block_download.on_stage_result(result);
                for offender in offenders {
                    self.close_offender(offender);
                }
                self.process_blockdownload_stage();
                self.do_requests();
            }
            Event::ForwardBlockrep { conn_id, bodies } => {
                let Some(peer) = self.registry.get(conn_id) else {
                    return;
                };
                let nonce = peer.last_nonce;
                let frame = Message::Blockrep(BlockrepMsg { nonce, bodies }).frame();
                self.send_throttled(conn_id, frame, self.config.block_throttle());
            }
            Event::FailedOutbound(addr) => {
                if self.dial_planner.on_failed_outbound(addr, Instant::now()) {
                    self.update_wakeup();
                }
                self.connect_scheduled();
            }
            Event::Pin(addr) => {
                self.dial_planner.pin(addr, Instant::now());
                self.update_wakeup();
            }
            Event::Unpin(addr) => {
                self.dial_planner.unpin(addr);
                self.update_wakeup();
            }
            Event::GetPeers {
                cb,
                filter_throttled,
            } => cb(self.collect_peers(filter_throttled)),
            Event::GetSynced(cb) => cb(!self.block_download.is_active()),
            Event::GetHashrate { cb, n } => cb(HashrateInfo {
                n_blocks: n,
                estimate: self.chains.consensus_headers().hashrate(n),
            }),
            Event::GetHashrateChart {
                cb,
                from,
                to,
                window,
            } => cb(HashrateChart {
                window,
                points: self.chains.consensus_headers().hashrate_chart(from, to, window),
            }),
            Event::Inspect(cb) => cb(&Inspector { inner: self }),
        }
    }

    fn collect_peers(&self, filter_throttled: bool) -> Vec<PeerInfo> {
        let mut out = Vec::new();
        for id in self.registry.initialized_ids() {
            let Some(peer) = self.registry.get(id) else {
                continue;
            };
            if filter_throttled && peer.throttled.queued() > 0 {
                continue;
            }
            out.push(PeerInfo {
                id,
                address: peer.link.peer_addr().to_string(),
                inbound: peer.link.conn().inbound(),
                since: peer.link.conn().connected_since(),
                initialized: true,
                chain: peer.chain.as_ref().map(|chain| PeerChainInfo {
                    descriptor: chain.view().descriptor,
                    length: chain.view().length,
                    worksum: chain.view().worksum.to_string(),
                }),
                their_snapshot_priority: SnapshotPriorityInfo {
                    importance: peer.their_snapshot_priority.importance,
                    height: peer.their_snapshot_priority.height,
                },
                acknowledged_snapshot_priority: SnapshotPriorityInfo {
                    importance: peer.acknowledged_snapshot_priority.importance,
                    height: peer.acknowledged_snapshot_priority.height,
                },
                throttle: ThrottleState {
                    queued: peer.throttled.queued(),
                },
            });
        }
        out
    }

    ////////////////////////
    // timers

    fn handle_timeout(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Connect => {
                self.wakeup_timer = None;
                self.connect_scheduled();
                self.update_wakeup();
            }
            TimerEvent::SendPing { conn_id } => {
                let Some(peer) = self.registry.get_mut(conn_id) else {
                    return;
                };
                if peer.link.erased() {
                    return;
                }
                peer.ping.on_timer_fired();
                self.send_ping_await_pong(conn_id);
            }
            TimerEvent::CloseNoPong { conn_id } => {
                if let Some(peer) = self.registry.get_mut(conn_id) {
                    peer.ping.on_timer_fired();
                    self.close(conn_id, ErrorCode::Timeout);
                }
            }
            TimerEvent::CloseNoReply { conn_id } => {
                if self.registry.get(conn_id).is_some() {
                    self.close(conn_id, ErrorCode::Timeout);
                }
            }
            TimerEvent::Expire { conn_id } => self.handle_request_expiry(conn_id),
            TimerEvent::ThrottledSend { conn_id } => {
                let now = Instant::now();
                let Inner {
                    registry, timer, ..
                } = self;
                let Some(peer) = registry.get_mut(conn_id) else {
                    return;
                };
                if let Some(buffer) = peer.throttled.on_fire(now, timer, conn_id) {
                    peer.send(buffer);
                }
            }
        }
    }

    fn handle_request_expiry(&mut self, conn_id: u64) {
        let close_key = self.timer.insert(
            Instant::now() + self.config.close_no_reply(),
            TimerEvent::CloseNoReply { conn_id },
        );
        let Some(peer) = self.registry.get_mut(conn_id) else {
            self.timer.cancel(close_key);
            return;
        };
        if !peer.job.has_outstanding() {
            self.timer.cancel(close_key);
            return;
        }
        let data = peer.job.expire(close_key, &mut self.active_requests);
        match data {
            JobData::Probe(_) => self.header_download.on_probe_request_expire(conn_id),
            JobData::Batch(req) => self.header_download.on_request_expire(conn_id, &req),
            JobData::Block(_) => self.block_download.on_blockreq_expire(conn_id),
            JobData::AwaitInit | JobData::Idle => {}
        }
        self.do_requests();
    }

    ////////////////////////
    // connection lifecycle

    fn process_connection(&mut self, link: Arc<Link>) {
        if link.erased() {
            return;
        }
        let conn_id = link.id();
        if !link.registered() {
            link.set_registered();
            let init_key = self.timer.insert(
                Instant::now() + self.config.init_deadline(),
                TimerEvent::CloseNoReply { conn_id },
            );
            if let Err(code) = self.registry.insert(Arc::clone(&link), init_key) {
                self.timer.cancel(init_key);
                link.conn().async_close(code.code());
                link.set_erased();
                return;
            }
            if !link.conn().inbound() {
                self.dial_planner
                    .on_established(link.peer_addr(), Instant::now());
            }
            self.update_wakeup();
            self.connect_scheduled();
            if self.config.log_communication {
                log_info!("{} connected", link.peer_addr());
            }
            self.send_init(conn_id);
        }
        let messages = link.conn().extract_messages();
        for message in messages {
            if let Err(code) = self.dispatch_message(conn_id, &message) {
                self.close(conn_id, code);
                self.do_requests();
                break;
            }
            if link.erased() {
                return;
            }
        }
    }

    fn erase(&mut self, conn_id: u64, error: i32) {
        let now = Instant::now();
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return;
        };
        if peer.link.erased() {
            return;
        }
        peer.link.set_erased();
        peer.job.unref_active_requests(&mut self.active_requests);
        if let Some(key) = peer.job.timer_key() {
            self.timer.cancel(key);
        }
        if let Some(key) = peer.ping.timer_key() {
            self.timer.cancel(key);
        }
        if let Some(key) = peer.throttled.timer_key() {
            self.timer.cancel(key);
        }
        let addr = peer.link.peer_addr();
        let inbound = peer.link.conn().inbound();

        if self.header_download.erase(conn_id) && !self.shutting_down {
            log_info!(
                "Connected to {} peers (closed connection to {}, reason: {})",
                self.header_download.size(),
                addr,
                close_reason_name(error)
            );
        }
        if self.block_download.erase(conn_id) {
            self.coordinate_sync();
        }
        if !inbound {
            self.dial_planner.on_disconnected(addr, now);
            self.update_wakeup();
        }
        if !self.shutting_down {
            // a freed slot should be refilled in the same pass
            self.do_requests();
        }
    }

    fn close(&mut self, conn_id: u64, reason: ErrorCode) {
        let Some(peer) = self.registry.get(conn_id) else {
            return;
        };
        if peer.link.erased() {
            return;
        }
        let addr = peer.link.peer_addr();
        peer.link.conn().async_close(reason.code());
        self.peer_db.report_offense(addr, reason);
        self.erase(conn_id, reason.code());
    }

    fn close_offender(&mut self, offender: Offender) {
        self.close(offender.conn_id, offender.code);
    }

    fn send_init(&mut self, conn_id: u64) {
        let msg = Message::Init(InitMsg {
            descriptor: self.chains.descriptor(),
            snapshot_priority: self.chains.snapshot_priority(),
            chain_length: self.chains.consensus_length(),
            worksum: self.chains.consensus_work(),
        })
        .frame();
        if let Some(peer) = self.registry.get(conn_id) {
            peer.send(msg);
        }
    }

    ////////////////////////
    // inbound dispatch

    fn dispatch_message(&mut self, conn_id: u64, buffer: &Rcvbuffer) -> Result<(), ErrorCode> {
        if !buffer.verify() {
            return Err(ErrorCode::Checksum);
        }
        let message = buffer.parse()?;
        let awaiting_init = match self.registry.get(conn_id) {
            Some(peer) => peer.job.is_awaiting_init(),
            None => return Ok(()),
        };
        if awaiting_init && !matches!(message, Message::Init(_)) {
            log_error!(
                "Expected init message from [{}] but got {}",
                conn_id,
                message.name()
            );
            return Err(ErrorCode::NoInit);
        }
        if !awaiting_init && matches!(message, Message::Init(_)) {
            return Err(ErrorCode::InvInit);
        }
        if self.config.log_communication {
            log_info!("[{}] handle {}", conn_id, message.name());
        }
        match message {
            Message::Init(m) => self.handle_init(conn_id, m),
            Message::Append(m) => self.handle_append(conn_id, m),
            Message::Fork(m) => self.handle_fork(conn_id, m),
            Message::SignedPinRollback(m) => self.handle_rollback(conn_id, m),
            Message::Ping(m) => self.handle_ping(conn_id, m),
            Message::Pong(m) => self.handle_pong(conn_id, m),
            Message::Batchreq(m) => self.handle_batchreq(conn_id, m),
            Message::Batchrep(m) => self.handle_batchrep(conn_id, m),
            Message::Probereq(m) => self.handle_probereq(conn_id, m),
            Message::Proberep(m) => self.handle_proberep(conn_id, m),
            Message::Blockreq(m) => self.handle_blockreq(conn_id, m),
            Message::Blockrep(m) => self.handle_blockrep(conn_id, m),
            Message::Txnotify(m) => self.handle_txnotify(conn_id, m),
            Message::Txreq(m) => self.handle_txreq(conn_id, m),
            Message::Txrep(m) => self.handle_txrep(conn_id, m),
            Message::Leader(m) => self.handle_leader(conn_id, m),
        }
    }

    fn handle_init(&mut self, conn_id: u64, m: InitMsg) -> Result<(), ErrorCode> {
        let chain = PeerChain::new(&m, &self.chains);
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        peer.job.on_init_received(&mut self.timer);
        peer.chain = Some(chain);
        peer.tx_subscription = m.chain_length + 1;
        if peer.their_snapshot_priority < m.snapshot_priority {
            peer.their_snapshot_priority = m.snapshot_priority;
        }
        let addr = peer.link.peer_addr();
        self.header_download.insert(conn_id);
        self.block_download.insert(conn_id);
        log_info!(
            "Connected to {} peers (new peer {})",
            self.header_download.size(),
            addr
        );
        self.send_ping_await_pong(conn_id);
        self.do_requests();
        Ok(())
    }

    fn handle_append(&mut self, conn_id: u64, m: AppendMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let Some(chain) = peer.chain.as_mut() else {
            return Err(ErrorCode::NoInit);
        };
        chain.on_peer_append(&m, &self.chains)?;
        let view = *chain.view();
        self.header_download.on_append(conn_id, &view);
        self.block_download.on_append(conn_id);
        self.do_requests();
        Ok(())
    }

    fn handle_fork(&mut self, conn_id: u64, m: ForkMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let Some(chain) = peer.chain.as_mut() else {
            return Err(ErrorCode::NoInit);
        };
        chain.on_peer_fork(&m, &self.chains)?;
        let view = *chain.view();
        self.header_download.on_fork(conn_id, &view);
        self.block_download.on_fork(conn_id);
        self.do_requests();
        Ok(())
    }

    fn handle_rollback(&mut self, conn_id: u64, m: SignedPinRollbackMsg) -> Result<(), ErrorCode> {
        self.verify_rollback(conn_id, &m)?;
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let Some(chain) = peer.chain.as_mut() else {
            return Err(ErrorCode::NoInit);
        };
        chain.on_peer_shrink(&m, &self.chains)?;
        let view = *chain.view();
        self.header_download.on_rollback(conn_id, &view);
        self.block_download.on_rollback(conn_id);
        self.do_requests();
        Ok(())
    }

    // A rollback claim is checked against what we already know about the
    // peer's fork ranges: shrinking a region we know agrees with one of our
    // snapshot-compatible chains cannot be justified.
    fn verify_rollback(&self, conn_id: u64, m: &SignedPinRollbackMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get(conn_id) else {
            return Ok(());
        };
        let Some(chain) = peer.chain.as_ref() else {
            return Err(ErrorCode::NoInit);
        };
        if chain.view().length <= m.shrink_length {
            return Err(ErrorCode::BadRollbackLen);
        }
        let snapshot = &m.snapshot;
        if chain.stage_fork().lower() > snapshot.height() {
            if snapshot.compatible(self.chains.stage_headers()) {
                return Err(ErrorCode::BadRollback);
            }
        } else if chain.consensus_fork().lower() > snapshot.height()
            && snapshot.compatible(self.chains.consensus_headers())
        {
            return Err(ErrorCode::BadRollback);
        }
        Ok(())
    }

    fn handle_ping(&mut self, conn_id: u64, m: PingMsg) -> Result<(), ErrorCode> {
        let now = Instant::now();
        let ping_floor = self.config.ping_floor();
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        if let Some(last) = peer.last_ping_recv {
            if now.duration_since(last) < ping_floor {
                return Err(ErrorCode::PingFloor);
            }
        }
        peer.last_ping_recv = Some(now);
        if peer.their_snapshot_priority < m.snapshot_priority {
            peer.their_snapshot_priority = m.snapshot_priority;
        }
        let mut rng = rand::thread_rng();
        let addresses = self
            .dial_planner
            .sample_verified(m.max_addresses.min(PING_MAX_ADDRESSES) as usize, &mut rng);
        let txids = self.mempool.sample(
            m.max_transactions.min(PING_MAX_TRANSACTIONS) as usize,
            &mut rng,
        );
        log_debug!("[{}] sending {} addresses", conn_id, addresses.len());
        let pong = Message::Pong(PongMsg {
            nonce: m.nonce,
            addresses,
            txids,
        })
        .frame();
        if let Some(peer) = self.registry.get(conn_id) {
            peer.send(pong);
        }
        self.consider_send_snapshot(conn_id);
        Ok(())
    }

    fn handle_pong(&mut self, conn_id: u64, m: PongMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let sent_priority = peer.ping.check(m.nonce)?;
        self.received_pong_sleep_ping(conn_id);
        self.dial_planner.queue_candidates(&m.addresses, Instant::now());
        log_debug!(
            "[{}] received {} addresses, {} txids",
            conn_id,
            m.addresses.len(),
            m.txids.len()
        );
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        if peer.acknowledged_snapshot_priority < sent_priority {
            peer.acknowledged_snapshot_priority = sent_priority;
        }
        let unknown = self.mempool.filter_new(&m.txids);
        if !unknown.is_empty() {
            if let Some(peer) = self.registry.get(conn_id) {
                peer.send(Message::Txreq(TxreqMsg { txids: unknown }).frame());
            }
        }
        self.connect_scheduled();
        Ok(())
    }

    fn handle_batchreq(&mut self, conn_id: u64, m: BatchreqMsg) -> Result<(), ErrorCode> {
        if m.length == 0 || m.length > MAX_BATCH_HEADERS || m.start_height == 0 {
            return Err(ErrorCode::BatchSize);
        }
        let end = m.start_height + m.length - 1;
        let headers = if m.descriptor == self.chains.descriptor() {
            self.chains.consensus_headers().get_headers(m.start_height, end)
        } else {
            self.chain_server.get_headers(&BatchSelector {
                descriptor: m.descriptor,
                start_height: m.start_height,
                length: m.length,
            })
        };
        let frame = Message::Batchrep(BatchrepMsg {
            nonce: m.nonce,
            headers,
        })
        .frame();
        self.send_throttled(conn_id, frame, self.config.batch_throttle());
        Ok(())
    }

    fn handle_batchrep(&mut self, conn_id: u64, m: BatchrepMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let req = peer
            .job
            .pop_batch(m.nonce, &mut self.timer, &mut self.active_requests)?;
        let count = m.headers.len() as u32;
        if count < req.min_return || count > req.max_return {
            self.close_offender(Offender {
                conn_id,
                code: ErrorCode::BatchSize,
            });
            return Ok(());
        }
        let offenders = self
            .header_download
            .on_response(conn_id, req, m.headers, &self.chains);
        for offender in offenders {
            self.close_offender(offender);
        }
        self.initialize_block_download();
        self.do_requests();
        Ok(())
    }

    fn handle_probereq(&mut self, conn_id: u64, m: ProbereqMsg) -> Result<(), ErrorCode> {
        let current = self.chains.consensus_headers().get_header(m.height).copied();
        let requested = if m.descriptor == self.chains.descriptor() {
            current
        } else {
            self.chain_server.get_descriptor_header(m.descriptor, m.height)
        };
        let frame = Message::Proberep(ProberepMsg {
            nonce: m.nonce,
            current_descriptor: self.chains.descriptor(),
            current,
            requested,
        })
        .frame();
        self.send_throttled(conn_id, frame, Duration::ZERO);
        Ok(())
    }

    fn handle_proberep(&mut self, conn_id: u64, m: ProberepMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let req = peer
            .job
            .pop_probe(m.nonce, &mut self.timer, &mut self.active_requests)?;
        let Some(chain) = peer.chain.as_mut() else {
            return Err(ErrorCode::NoInit);
        };
        // an empty answer for a descriptor the peer still claims is hiding
        if m.requested.is_none() && chain.view().descriptor == req.descriptor {
            return Err(ErrorCode::Empty);
        }
        chain.on_proberep(&req, &m, &self.chains)?;
        self.header_download.on_proberep(conn_id);
        self.do_requests();
        Ok(())
    }

    fn handle_blockreq(&mut self, conn_id: u64, m: BlockreqMsg) -> Result<(), ErrorCode> {
        if m.lower == 0 || m.lower > m.upper || m.upper - m.lower + 1 > MAX_BODIES {
            return Err(ErrorCode::BlockRange);
        }
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        peer.last_nonce = m.nonce;
        let handle = self.handle.clone();
        self.chain_server.async_get_blocks(
            BlockRange {
                lower: m.lower,
                upper: m.upper,
            },
            Box::new(move |bodies| handle.async_forward_blockrep(conn_id, bodies)),
        );
        Ok(())
    }

    fn handle_blockrep(&mut self, conn_id: u64, m: BlockrepMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        let req = peer
            .job
            .pop_block(m.nonce, &mut self.timer, &mut self.active_requests)?;
        match self.block_download.on_blockreq_reply(conn_id, m, req) {
            Ok(()) => self.process_blockdownload_stage(),
            Err(code) => self.close(conn_id, code),
        }
        self.do_requests();
        Ok(())
    }

    fn handle_txnotify(&mut self, conn_id: u64, m: TxnotifyMsg) -> Result<(), ErrorCode> {
        let unknown = self.mempool.filter_new(&m.txids);
        if !unknown.is_empty() {
            if let Some(peer) = self.registry.get(conn_id) {
                peer.send(Message::Txreq(TxreqMsg { txids: unknown }).frame());
            }
        }
        self.do_requests();
        Ok(())
    }

    fn handle_txreq(&mut self, conn_id: u64, m: TxreqMsg) -> Result<(), ErrorCode> {
        if m.txids.is_empty() {
            return Ok(());
        }
        let txs: Vec<Option<Vec<u8>>> = m
            .txids
            .iter()
            .map(|txid| self.mempool.get(txid).map(|tx| tx.raw.clone()))
            .collect();
        let frame = Message::Txrep(TxrepMsg { txs }).frame();
        self.send_throttled(conn_id, frame, self.config.tx_throttle());
        Ok(())
    }

    fn handle_txrep(&mut self, _conn_id: u64, m: TxrepMsg) -> Result<(), ErrorCode> {
        let txs: Vec<Vec<u8>> = m.txs.into_iter().flatten().collect();
        if !txs.is_empty() {
            self.chain_server.async_put_mempool(txs);
        }
        self.do_requests();
        Ok(())
    }

    fn handle_leader(&mut self, conn_id: u64, m: LeaderMsg) -> Result<(), ErrorCode> {
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };
        if m.snapshot.priority <= peer.acknowledged_snapshot_priority {
            return Err(ErrorCode::LowPriority);
        }
        peer.acknowledged_snapshot_priority = m.snapshot.priority;
        if peer.their_snapshot_priority < m.snapshot.priority {
            peer.their_snapshot_priority = m.snapshot.priority;
        }
        self.chain_server.async_set_signed_checkpoint(m.snapshot);
        Ok(())
    }

    ////////////////////////
    // pings and throttling

    fn send_ping_await_pong(&mut self, conn_id: u64) {
        let key = self.timer.insert(
            Instant::now() + self.config.ping_deadline(),
            TimerEvent::CloseNoPong { conn_id },
        );
        let nonce = rand::thread_rng().next_u64();
        let snapshot_priority = self.chains.snapshot_priority();
        let Some(peer) = self.registry.get_mut(conn_id) else {
            self.timer.cancel(key);
            return;
        };
        peer.ping.await_pong(nonce, snapshot_priority, key);
        if self.config.log_communication {
            log_info!("[{}] sending ping", conn_id);
        }
        peer.send(
            Message::Ping(PingMsg {
                nonce,
                snapshot_priority,
                max_addresses: PING_MAX_ADDRESSES,
                max_transactions: PING_MAX_TRANSACTIONS,
            })
            .frame(),
        );
    }

    fn received_pong_sleep_ping(&mut self, conn_id: u64) {
        let key = self.timer.insert(
            Instant::now() + self.config.ping_sleep(),
            TimerEvent::SendPing { conn_id },
        );
        let Some(peer) = self.registry.get_mut(conn_id) else {
            self.timer.cancel(key);
            return;
        };
        if let Some(old) = peer.ping.sleep(key) {
            self.timer.cancel(old);
        }
    }

    fn send_throttled(&mut self, conn_id: u64, buffer: Vec<u8>, gap: Duration) {
        let now = Instant::now();
        let Inner {
            registry, timer, ..
        } = self;
        let Some(peer) = registry.get_mut(conn_id) else {
            return;
        };
        if peer.link.erased() {
            return;
        }
        peer.throttled.insert(buffer, gap, now, timer, conn_id);
    }

    fn consider_send_snapshot(&mut self, conn_id: u64) {
        let Some(snapshot) = self.chains.signed_snapshot().cloned() else {
            return;
        };
        let Some(peer) = self.registry.get_mut(conn_id) else {
            return;
        };
        if peer.their_snapshot_priority < snapshot.priority {
            peer.their_snapshot_priority = snapshot.priority;
            peer.send(Message::Leader(LeaderMsg { snapshot }).frame());
        }
    }

    ////////////////////////
    // chain updates

    fn update_chain_append(&mut self, append: Append) {
        let info = match self.chains.update_consensus_append(append) {
            Ok(info) => info,
            Err(err) => {
                log_error!("consensus append rejected: {err}");
                return;
            }
        };
        self.log_chain_length();
        let frame = Message::Append(AppendMsg {
            new_length: info.new_length,
            worksum: info.worksum,
        })
        .frame();
        for id in self.registry.ids() {
            let Some(peer) = self.registry.get_mut(id) else {
                continue;
            };
            if peer.link.erased() {
                continue;
            }
            if let Some(chain) = peer.chain.as_mut() {
                chain.on_consensus_append(&self.chains);
            }
            peer.send(frame.clone());
        }
        for id in self.registry.initialized_ids() {
            self.consider_send_snapshot(id);
        }
        self.coordinate_sync();
        self.do_requests();
    }

    fn update_chain_fork(&mut self, fork: Fork) {
        let info = match self.chains.update_consensus_fork(fork) {
            Ok(info) => info,
            Err(err) => {
                log_error!("consensus fork rejected: {err}");
                return;
            }
        };
        self.log_chain_length();
        self.header_download.on_consensus_change();
        let frame = Message::Fork(ForkMsg {
            fork_height: info.fork_height,
            new_length: info.new_length,
            worksum: info.worksum,
            descriptor: info.descriptor,
        })
        .frame();
        for id in self.registry.ids() {
            let Some(peer) = self.registry.get_mut(id) else {
                continue;
            };
            if peer.link.erased() {
                continue;
            }
            if let Some(chain) = peer.chain.as_mut() {
                chain.on_consensus_fork(info.fork_height, &self.chains);
            }
            peer.send(frame.clone());
        }
        self.coordinate_sync();
        self.do_requests();
    }

    fn update_chain_rollback(&mut self, rollback: RollbackData) {
        self.block_download.reset_if_incompatible(&rollback.snapshot);
        if let Some(info) = self.chains.update_consensus_rollback(&rollback) {
            self.log_chain_length();
            let frame = Message::SignedPinRollback(SignedPinRollbackMsg {
                snapshot: info.snapshot.clone(),
                shrink_length: info.shrink_length,
                worksum: info.worksum,
                descriptor: info.descriptor,
            })
            .frame();
            for id in self.registry.ids() {
                let Some(peer) = self.registry.get_mut(id) else {
                    continue;
                };
                if peer.link.erased() {
                    continue;
                }
                if let Some(chain) = peer.chain.as_mut() {
                    chain.on_consensus_shrink(&self.chains);
                }
                peer.send(frame.clone());
            }
        }
        self.header_download.on_signed_snapshot_update();
        for id in self.registry.initialized_ids() {
            self.consider_send_snapshot(id);
        }
        self.coordinate_sync();
        log_debug!("init blockdownload after rollback");
        self.initialize_block_download();
        self.do_requests();
    }

    fn log_chain_length(&self) {
        let synced = self.chains.consensus_length();
        let total = self.chains.stage_headers().length();
        if synced < total {
            log_info!("Syncing... (height {} of {})", synced, total);
        } else if synced == total {
            log_info!("Synced. (height {}).", synced);
        }
    }

    ////////////////////////
    // sync coordination

    fn coordinate_sync(&mut self) {
        let consensus = self.chains.consensus_work();
        let reachable = self.block_download.get_reachable_totalwork();
        self.header_download
            .set_min_worksum(consensus.max(reachable));
        self.block_download.set_min_worksum(consensus);
    }

    fn initialize_block_download(&mut self) {
        let Some(chain) = self.header_download.pop_data() else {
            return;
        };
        let fork_height = self.chains.update_stage(chain.clone());
        log_info!(
            "Syncing... (height {} of {})",
            self.chains.consensus_length(),
            chain.length()
        );
        for id in self.registry.initialized_ids() {
            if let Some(peer) = self.registry.get_mut(id) {
                if let Some(peer_chain) = peer.chain.as_mut() {
                    peer_chain.on_stage_update(fork_height, &self.chains);
                }
            }
        }
        let offenders = self.block_download.init(chain, fork_height);
        for offender in offenders {
            self.close_offender(offender);
        }
        self.coordinate_sync();
        self.process_blockdownload_stage();
    }

    fn process_blockdownload_stage(&mut self) {
        if let Some(request) = self.block_download.pop_stage() {
            self.chain_server.async_stage_request(request);
        }
    }

    fn do_requests(&mut self) {
        loop {
            let offenders = {
                let Inner {
                    registry,
                    timer,
                    active_requests,
                    config,
                    header_download,
                    chains,
                    ..
                } = self;
                let mut sender = RequestSender {
                    registry,
                    timer,
                    active_requests,
                    max_requests: config.max_requests,
                    config,
                    log_communication: config.log_communication,
                };
                header_download.do_header_requests(&mut sender, chains)
            };
            if offenders.is_empty() {
                break;
            }
            for offender in offenders {
                self.close_offender(offender);
            }
        }
        {
            let Inner {
                registry,
                timer,
                active_requests,
                config,
                block_download,
                ..
            } = self;
            let mut sender = RequestSender {
                registry,
                timer,
                active_requests,
                max_requests: config.max_requests,
                config,
                log_communication: config.log_communication,
            };
            block_download.do_block_requests(&mut sender);
        }
        {
            let Inner {
                registry,
                timer,
                active_requests,
                config,
                header_download,
                chains,
                ..
            } = self;
            let mut sender = RequestSender {
                registry,
                timer,
                active_requests,
                max_requests: config.max_requests,
                config,
                log_communication: config.log_communication,
            };
            header_download.do_probe_requests(&mut sender, chains);
        }
    }

    ////////////////////////
    // mempool gossip

    fn handle_mempool_log(&mut self, log: mempool::Log) {
        self.mempool.apply_log(&log);
        let entries = mempool::sort_new_entries(&log);
        if entries.is_empty() {
            return;
        }
        let mut subscriptions: Vec<(Height, u64)> = self
            .registry
            .initialized_ids()
            .into_iter()
            .filter_map(|id| {
                self.registry
                    .get(id)
                    .map(|peer| (peer.tx_subscription, id))
            })
            .collect();
        subscriptions.sort();
        for (conn_id, end) in mempool::notify_slices(&entries, &subscriptions) {
            let txids = entries[..end].iter().map(|&(_, txid)| txid).collect();
            if let Some(peer) = self.registry.get(conn_id) {
                peer.send(Message::Txnotify(TxnotifyMsg { txids }).frame());
            }
        }
    }

    ////////////////////////
    // dialing

    fn connect_scheduled(&mut self) {
        for addr in self.dial_planner.pop_connect(Instant::now()) {
            self.dialer.async_connect(addr);
        }
    }

    fn update_wakeup(&mut self) {
        let wakeup = self.dial_planner.wakeup_time();
        if let Some(key) = self.wakeup_timer {
            if wakeup == Some(key.0) {
                return;
            }
            self.timer.cancel(key);
            self.wakeup_timer = None;
        }
        if let Some(at) = wakeup {
            self.wakeup_timer = Some(self.timer.insert(at, TimerEvent::Connect));
        }
    }

    ////////////////////////
    // sync state

    fn update_sync_state(&mut self) {
        self.sync_state
            .set_has_connections(self.registry.initialized_len() > 0);
        self.sync_state
            .set_block_download(self.block_download.is_active());
        self.sync_state
            .set_header_download(self.header_download.is_active(&self.registry));
        if let Some(synced) = self.sync_state.detect_change() {
            self.peer_db.async_set_synced(synced);
        }
    }
}
