use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use basalt_chain::{
    Append, ChainstateUpdate, HeaderChain, RollbackData, SignedSnapshot, SnapshotPriority,
    StageAndConsensus, SIGNATURE_LEN,
};
use basalt_node::error::ErrorCode;
use basalt_node::eventloop::{Eventloop, Handle, Inspector};
use basalt_node::interfaces::{
    BatchSelector, BlockRange, ChainServer, Dialer, PeerDb, StageRequest,
    StageResult, StateUpdate,
};
use basalt_node::mempool::{LogAction, MempoolTx};
use basalt_node::transport::{Conn, Link};
use basalt_node::wire::{
    BatchrepMsg, BlockrepMsg, InitMsg, LeaderMsg, Message, PingMsg, PongMsg, Rcvbuffer,
    TxnotifyMsg, TxrepMsg,
};
use basalt_node::NodeConfig;
use basalt_pow::Worksum;
use basalt_primitives::{BodyContainer, Header, Height};
use crossbeam_channel::{unbounded, Receiver, Sender};

const TEST_BITS: u32 = 0x2100ffff;

fn make_headers(prev: basalt_primitives::Hash256, count: usize, salt: u32) -> Vec<Header> {
    let mut prev = prev;
    let mut out = Vec::with_capacity(count);
    for i in 0..count as u32 {
        let header = Header {
            prev_hash: prev,
            tx_root: [salt as u8; 32],
            target_bits: TEST_BITS,
            time: 1_700_000_000 + (salt + i) * 30,
            nonce: salt.wrapping_mul(1000).wrapping_add(i),
        };
        prev = header.hash();
        out.push(header);
    }
    out
}

fn chain_of(headers: &[Header]) -> HeaderChain {
    HeaderChain::from_headers(headers.to_vec()).expect("well-linked headers")
}

struct TestConn {
    id: u64,
    addr: SocketAddr,
    inbound: bool,
    inbox: Mutex<VecDeque<Rcvbuffer>>,
    outbox: Sender<Vec<u8>>,
    closed: Sender<i32>,
}

impl Conn for TestConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connected_since(&self) -> u64 {
        1_700_000_000
    }

    fn inbound(&self) -> bool {
        self.inbound
    }

    fn asyncsend(&self, buffer: Vec<u8>) {
        let _ = self.outbox.send(buffer);
    }

    fn async_close(&self, reason: i32) {
        let _ = self.closed.send(reason);
    }

    fn extract_messages(&self) -> Vec<Rcvbuffer> {
        self.inbox.lock().expect("inbox").drain(..).collect()
    }
}

struct TestPeer {
    link: Arc<Link>,
    conn: Arc<TestConn>,
    out: Receiver<Vec<u8>>,
    closed: Receiver<i32>,
}

impl TestPeer {
    fn new(id: u64) -> Self {
        let (out_tx, out_rx) = unbounded();
        let (closed_tx, closed_rx) = unbounded();
        let conn = Arc::new(TestConn {
            id,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, id as u8), 9186)),
            inbound: true,
            inbox: Mutex::new(VecDeque::new()),
            outbox: out_tx,
            closed: closed_tx,
        });
        let link = Link::new(conn.clone());
        Self {
            link,
            conn,
            out: out_rx,
            closed: closed_rx,
        }
    }

    fn deliver(&self, handle: &Handle, message: Message) {
        self.deliver_raw(handle, message.frame());
    }

    fn deliver_raw(&self, handle: &Handle, frame: Vec<u8>) {
        self.conn
            .inbox
            .lock()
            .expect("inbox")
            .push_back(Rcvbuffer::new(frame));
        assert!(handle.async_process(self.link.clone()));
    }

    fn next_message(&self, timeout: Duration) -> Option<Message> {
        self.out
            .recv_timeout(timeout)
            .ok()
            .map(|frame| Rcvbuffer::new(frame).parse().expect("outbound frame"))
    }

    fn drain_messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = self.out.try_recv() {
            out.push(Rcvbuffer::new(frame).parse().expect("outbound frame"));
        }
        out
    }

    fn close_reason(&self, timeout: Duration) -> Option<i32> {
        self.closed.recv_timeout(timeout).ok()
    }

    fn init_msg(chain: &HeaderChain) -> InitMsg {
        InitMsg {
            descriptor: 1,
            snapshot_priority: SnapshotPriority::default(),
            chain_length: chain.length(),
            worksum: chain.total_work(),
        }
    }
}

#[derive(Clone, Default)]
struct ServerLog {
    stage_requests: Arc<Mutex<Vec<StageRequest>>>,
    mempool_puts: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    checkpoints: Arc<Mutex<Vec<SignedSnapshot>>>,
    block_requests: Arc<Mutex<Vec<BlockRange>>>,
}

struct TestChainServer {
    chains: StageAndConsensus,
    log: ServerLog,
}

impl TestChainServer {
    fn new(consensus: HeaderChain) -> (Self, ServerLog) {
        let log = ServerLog::default();
        (
            Self {
                chains: StageAndConsensus::new(consensus, None),
                log: log.clone(),
            },
            log,
        )
    }
}

impl ChainServer for TestChainServer {
    fn get_chainstate(&self) -> StageAndConsensus {
        self.chains.clone()
    }

    fn get_headers(&self, _selector: &BatchSelector) -> Vec<Header> {
        Vec::new()
    }

    fn get_descriptor_header(&self, _descriptor: u32, _height: Height) -> Option<Header> {
        None
    }

    fn async_get_blocks(
        &self,
        range: BlockRange,
        reply: Box<dyn FnOnce(Vec<BodyContainer>) + Send>,
    ) {
        self.log.block_requests.lock().expect("log").push(range);
        let bodies = (range.lower..=range.upper)
            .map(|height| BodyContainer::new(vec![height as u8]).expect("body"))
            .collect();
        reply(bodies);
    }

    fn async_stage_request(&self, request: StageRequest) {
        self.log.stage_requests.lock().expect("log").push(request);
    }

    fn async_put_mempool(&self, txs: Vec<Vec<u8>>) {
        self.log.mempool_puts.lock().expect("log").push(txs);
    }

    fn async_set_signed_checkpoint(&self, snapshot: SignedSnapshot) {
        self.log.checkpoints.lock().expect("log").push(snapshot);
    }

    fn shutdown_join(&mut self) {}
}

#[derive(Clone, Default)]
struct TestPeerDb {
    synced: Arc<Mutex<Vec<bool>>>,
    offenses: Arc<Mutex<Vec<(SocketAddr, ErrorCode)>>>,
}

impl PeerDb for TestPeerDb {
    fn async_set_synced(&self, synced: bool) {
        self.synced.lock().expect("synced").push(synced);
    }

    fn report_offense(&self, addr: SocketAddr, code: ErrorCode) {
        self.offenses.lock().expect("offenses").push((addr, code));
    }

    fn async_get_banned(&self, cb: Box<dyn FnOnce(Vec<SocketAddr>) + Send>) {
        cb(Vec::new());
    }

    fn async_unban(&self, cb: Box<dyn FnOnce(bool) + Send>) {
        cb(true);
    }
}

#[derive(Clone, Default)]
struct TestDialer {
    dialed: Arc<Mutex<Vec<SocketAddr>>>,
}

impl Dialer for TestDialer {
    fn async_connect(&self, addr: SocketAddr) {
        self.dialed.lock().expect("dialed").push(addr);
    }
}

fn spawn_loop(
    consensus: HeaderChain,
    config: NodeConfig,
) -> (Eventloop, Handle, ServerLog, TestPeerDb, TestDialer) {
    let (server, log) = TestChainServer::new(consensus);
    let peer_db = TestPeerDb::default();
    let dialer = TestDialer::default();
    let eventloop = Eventloop::spawn(
        Box::new(server),
        Box::new(peer_db.clone()),
        Box::new(dialer.clone()),
        config,
    );
    let handle = eventloop.handle();
    (eventloop, handle, log, peer_db, dialer)
}

fn inspect<T: Send + 'static>(
    handle: &Handle,
    f: impl FnOnce(&Inspector) -> T + Send + 'static,
) -> T {
    let (tx, rx) = crossbeam_channel::bounded(1);
    handle.api_inspect(Box::new(move |inspector| {
        let _ = tx.send(f(inspector));
    }));
    rx.recv_timeout(Duration::from_secs(5)).expect("inspector callback")
}

fn init_peer(handle: &Handle, peer: &TestPeer, chain: &HeaderChain) {
    peer.deliver(handle, Message::Init(TestPeer::init_msg(chain)));
}

#[test]
fn first_message_must_be_init() {
    let (_loop_, handle, _log, peer_db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(1);
    peer.deliver(
        &handle,
        Message::Ping(PingMsg {
            nonce: 1,
            snapshot_priority: SnapshotPriority::default(),
            max_addresses: 4,
            max_transactions: 4,
        }),
    );
    assert_eq!(peer.close_reason(Duration::from_secs(5)), Some(ErrorCode::NoInit.code()));
    // only our own init went out, no pong
    let sent = peer.drain_messages();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0], Message::Init(_)));
    assert!(!inspect(&handle, |i| i.peer_exists(1)));
    let offenses = peer_db.offenses.lock().expect("offenses");
    assert_eq!(offenses.len(), 1);
    assert_eq!(offenses[0].1, ErrorCode::NoInit);
}

#[test]
fn second_init_is_fatal() {
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(2);
    let chain = HeaderChain::new();
    init_peer(&handle, &peer, &chain);
    assert!(inspect(&handle, |i| i.peer_initialized(2)));
    init_peer(&handle, &peer, &chain);
    assert_eq!(peer.close_reason(Duration::from_secs(5)), Some(ErrorCode::InvInit.code()));
}

#[test]
fn bad_checksum_is_fatal() {
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(3);
    let mut frame = Message::Init(TestPeer::init_msg(&HeaderChain::new())).frame();
    let last = frame.len() - 1;
    frame[last] ^= 0x5a;
    peer.deliver_raw(&handle, frame);
    assert_eq!(peer.close_reason(Duration::from_secs(5)), Some(ErrorCode::Checksum.code()));
}

#[test]
fn missed_pong_closes_with_timeout() {
    let config = NodeConfig {
        ping_deadline_ms: 80,
        ..NodeConfig::default()
    };
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), config);
    let peer = TestPeer::new(4);
    init_peer(&handle, &peer, &HeaderChain::new());
    // our init, then a ping
    let mut saw_ping = false;
    for _ in 0..2 {
        if let Some(Message::Ping(_)) = peer.next_message(Duration::from_secs(2)) {
            saw_ping = true;
        }
    }
    assert!(saw_ping);
    assert_eq!(peer.close_reason(Duration::from_secs(5)), Some(ErrorCode::Timeout.code()));
}

#[test]
fn pong_resets_ping_state_and_requests_unknown_txids() {
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(5);
    init_peer(&handle, &peer, &HeaderChain::new());
    let ping = loop {
        match peer.next_message(Duration::from_secs(2)) {
            Some(Message::Ping(m)) => break m,
            Some(_) => continue,
            None => panic!("expected a ping"),
        }
    };
    peer.deliver(
        &handle,
        Message::Pong(PongMsg {
            nonce: ping.nonce,
            addresses: vec![],
            txids: vec![[0xaa; 32]],
        }),
    );
    let txreq = loop {
        match peer.next_message(Duration::from_secs(2)) {
            Some(Message::Txreq(m)) => break m,
            Some(_) => continue,
            None => panic!("expected a txreq"),
        }
    };
    assert_eq!(txreq.txids, vec![[0xaa; 32]]);
    assert!(inspect(&handle, |i| i.peer_exists(5)));
}

#[test]
fn unsolicited_pong_is_fatal() {
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(6);
    init_peer(&handle, &peer, &HeaderChain::new());
    peer.deliver(
        &handle,
        Message::Pong(PongMsg {
            nonce: 424242,
            addresses: vec![],
            txids: vec![],
        }),
    );
    assert_eq!(
        peer.close_reason(Duration::from_secs(5)),
        Some(ErrorCode::Unsolicited.code())
    );
}

#[test]
fn basic_sync_downloads_and_validates_the_advertised_chain() {
    let target_headers = make_headers(basalt_chain::GENESIS_HASH, 30, 1);
    let target = chain_of(&target_headers);
    let (_loop_, handle, log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(7);
    init_peer(&handle, &peer, &target);

    let mut staged: Vec<StageRequest> = Vec::new();
    for _ in 0..400 {
        for message in peer.drain_messages() {
            match message {
                Message::Batchreq(req) => {
                    let start = req.start_height as usize;
                    let end = start + req.length as usize - 1;
                    let headers = target_headers[start - 1..end].to_vec();
                    peer.deliver(
                        &handle,
                        Message::Batchrep(BatchrepMsg {
                            nonce: req.nonce,
                            headers,
                        }),
                    );
                }
                Message::Blockreq(req) => {
                    let bodies = (req.lower..=req.upper)
                        .map(|height| BodyContainer::new(vec![height as u8]).expect("body"))
                        .collect();
                    peer.deliver(
                        &handle,
                        Message::Blockrep(BlockrepMsg {
                            nonce: req.nonce,
                            bodies,
                        }),
                    );
                }
                _ => {}
            }
        }
        {
            let mut pending = log.stage_requests.lock().expect("log");
            staged.extend(pending.drain(..));
        }
        if let Some(request) = staged.pop() {
            let until = request.lower + request.headers.len() as Height - 1;
            handle.async_stage_action(StageResult::Applied { until });
            handle.async_state_update(StateUpdate {
                mempool_log: vec![],
                chainstate: ChainstateUpdate::Append(Append {
                    headers: request.headers,
                }),
            });
        }
        let length = inspect(&handle, |i| i.consensus_length());
        if length == 30 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(inspect(&handle, |i| i.consensus_length()), 30);
    assert!(inspect(&handle, |i| i.peer_exists(7)));
    assert!(inspect(&handle, |i| i.synced()));
    assert_eq!(inspect(&handle, |i| i.active_requests()), 0);
}

#[test]
fn undersized_batch_closes_offender_and_frees_the_slot() {
    let target_headers = make_headers(basalt_chain::GENESIS_HASH, 30, 2);
    let target = chain_of(&target_headers);
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let bad = TestPeer::new(8);
    let good = TestPeer::new(9);
    init_peer(&handle, &bad, &target);
    init_peer(&handle, &good, &target);

    let req = loop {
        match bad.next_message(Duration::from_secs(2)) {
            Some(Message::Batchreq(req)) => break req,
            Some(_) => continue,
            None => panic!("expected a batch request"),
        }
    };
    assert!(req.length > 5);
    bad.deliver(
        &handle,
        Message::Batchrep(BatchrepMsg {
            nonce: req.nonce,
            headers: target_headers[..5].to_vec(),
        }),
    );
    assert_eq!(
        bad.close_reason(Duration::from_secs(5)),
        Some(ErrorCode::BatchSize.code())
    );
    // the other peer is unaffected and inherits the download
    assert!(inspect(&handle, |i| i.peer_exists(9)));
    assert!(!inspect(&handle, |i| i.peer_exists(8)));
    assert!(inspect(&handle, |i| i.peer_has_outstanding_job(9)));
    assert_eq!(inspect(&handle, |i| i.active_requests()), 1);
}

#[test]
fn request_slots_saturate_at_max_requests() {
    let config = NodeConfig::default();
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), config);
    // a claim large enough for ten outstanding batches
    let claim = InitMsg {
        descriptor: 1,
        snapshot_priority: SnapshotPriority::default(),
        chain_length: 5000,
        worksum: Worksum::from(1_000_000_000u64),
    };
    let peers: Vec<TestPeer> = (1..=15).map(TestPeer::new).collect();
    for peer in &peers {
        peer.deliver(&handle, Message::Init(claim.clone()));
    }
    assert_eq!(inspect(&handle, |i| i.initialized_peer_count()), 15);
    assert_eq!(inspect(&handle, |i| i.active_requests()), 10);
    assert_eq!(inspect(&handle, |i| i.outstanding_job_count()), 10);
    assert_eq!(inspect(&handle, |i| i.max_requests()), 10);
}

#[test]
fn authoritative_rollback_broadcasts_and_shrinks_consensus() {
    let consensus_headers = make_headers(basalt_chain::GENESIS_HASH, 10, 3);
    let consensus = chain_of(&consensus_headers);
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(consensus.clone(), NodeConfig::default());
    let peer = TestPeer::new(11);
    init_peer(&handle, &peer, &consensus);
    peer.drain_messages();

    // a pin for a different branch at height 2
    let other = chain_of(&make_headers(basalt_chain::GENESIS_HASH, 4, 9));
    let snapshot = SignedSnapshot {
        priority: SnapshotPriority {
            importance: 5,
            height: 2,
        },
        hash: other.hash_at(2).expect("hash"),
        signature: [3u8; SIGNATURE_LEN],
    };
    handle.async_state_update(StateUpdate {
        mempool_log: vec![],
        chainstate: ChainstateUpdate::Rollback(RollbackData {
            snapshot,
            shrink_length: 2,
        }),
    });

    assert_eq!(inspect(&handle, |i| i.consensus_length()), 2);
    assert!(!inspect(&handle, |i| i.block_download_active()));
    let mut saw_rollback = false;
    let mut saw_leader = false;
    for _ in 0..4 {
        match peer.next_message(Duration::from_secs(2)) {
            Some(Message::SignedPinRollback(m)) => {
                assert_eq!(m.shrink_length, 2);
                saw_rollback = true;
            }
            Some(Message::Leader(_)) => saw_leader = true,
            Some(_) => {}
            None => break,
        }
        if saw_rollback && saw_leader {
            break;
        }
    }
    assert!(saw_rollback);
    assert!(saw_leader);
    let priorities = inspect(&handle, |i| i.peer_snapshot_priorities(11)).expect("peer");
    assert_eq!(priorities.0, (5, 2));
}

#[test]
fn low_priority_leader_is_fatal() {
    let (_loop_, handle, log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(12);
    init_peer(&handle, &peer, &HeaderChain::new());

    let snapshot = SignedSnapshot {
        priority: SnapshotPriority {
            importance: 2,
            height: 1,
        },
        hash: [1u8; 32],
        signature: [0u8; SIGNATURE_LEN],
    };
    peer.deliver(
        &handle,
        Message::Leader(LeaderMsg {
            snapshot: snapshot.clone(),
        }),
    );
    assert_eq!(
        inspect(&handle, |i| i.peer_snapshot_priorities(12)),
        Some(((2, 1), (2, 1)))
    );
    assert_eq!(log.checkpoints.lock().expect("log").len(), 1);

    // resending the same (now stale) priority is an offense
    peer.deliver(&handle, Message::Leader(LeaderMsg { snapshot }));
    assert_eq!(
        peer.close_reason(Duration::from_secs(5)),
        Some(ErrorCode::LowPriority.code())
    );
}

#[test]
fn tx_gossip_round_trip_admits_and_renotifies() {
    let consensus = chain_of(&make_headers(basalt_chain::GENESIS_HASH, 10, 4));
    let (_loop_, handle, log, _db, _dialer) = spawn_loop(consensus.clone(), NodeConfig::default());
    let alice = TestPeer::new(13);
    let bob = TestPeer::new(14);
    init_peer(&handle, &alice, &consensus);
    init_peer(&handle, &bob, &consensus);
    alice.drain_messages();
    bob.drain_messages();

    let txid = [0x77; 32];
    alice.deliver(&handle, Message::Txnotify(TxnotifyMsg { txids: vec![txid] }));
    let txreq = loop {
        match alice.next_message(Duration::from_secs(2)) {
            Some(Message::Txreq(m)) => break m,
            Some(_) => continue,
            None => panic!("expected txreq"),
        }
    };
    assert_eq!(txreq.txids, vec![txid]);

    alice.deliver(
        &handle,
        Message::Txrep(TxrepMsg {
            txs: vec![Some(vec![0xde, 0xad])],
        }),
    );
    {
        let puts = loop {
            let puts = log.mempool_puts.lock().expect("log").clone();
            if !puts.is_empty() {
                break puts;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(puts, vec![vec![vec![0xde, 0xad]]]);
    }

    // chain server admits it; subscribed peers get a targeted notify
    handle.async_mempool_update(vec![LogAction::Put(MempoolTx {
        txid,
        transaction_height: 3,
        raw: vec![0xde, 0xad],
    })]);
    let notify = loop {
        match bob.next_message(Duration::from_secs(2)) {
            Some(Message::Txnotify(m)) => break m,
            Some(_) => continue,
            None => panic!("expected txnotify"),
        }
    };
    assert_eq!(notify.txids, vec![txid]);
    assert_eq!(inspect(&handle, |i| i.mempool_len()), 1);
}

#[test]
fn ping_flood_is_throttled() {
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(15);
    init_peer(&handle, &peer, &HeaderChain::new());
    for nonce in 0..2u64 {
        peer.deliver(
            &handle,
            Message::Ping(PingMsg {
                nonce,
                snapshot_priority: SnapshotPriority::default(),
                max_addresses: 4,
                max_transactions: 4,
            }),
        );
    }
    assert_eq!(
        peer.close_reason(Duration::from_secs(5)),
        Some(ErrorCode::PingFloor.code())
    );
}

#[test]
fn configured_peers_are_dialed() {
    let addr: SocketAddr = "127.0.0.1:19186".parse().expect("addr");
    let config = NodeConfig {
        connect: vec![addr],
        // keep the retry guard far away so the dial happens exactly once
        dial_backoff_start_ms: 60_000,
        ..NodeConfig::default()
    };
    let (_loop_, handle, _log, _db, dialer) = spawn_loop(HeaderChain::new(), config);
    // barrier: one full loop iteration has run
    inspect(&handle, |_| ());
    let dialed = dialer.dialed.lock().expect("dialed").clone();
    assert_eq!(dialed, vec![addr]);
}

#[test]
fn peers_api_reports_initialized_connections() {
    let consensus = chain_of(&make_headers(basalt_chain::GENESIS_HASH, 5, 8));
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(consensus.clone(), NodeConfig::default());
    let peer = TestPeer::new(21);
    init_peer(&handle, &peer, &consensus);
    let uninitialized = TestPeer::new(22);
    // registered but never sends init: must not show up
    assert!(handle.async_process(uninitialized.link.clone()));

    let (tx, rx) = crossbeam_channel::bounded(1);
    handle.api_get_peers(
        Box::new(move |peers| {
            let _ = tx.send(peers);
        }),
        false,
    );
    let peers = rx.recv_timeout(Duration::from_secs(5)).expect("peers");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, 21);
    assert!(peers[0].initialized);
    let chain = peers[0].chain.as_ref().expect("chain info");
    assert_eq!(chain.length, 5);
}

#[test]
fn hashrate_api_reports_consensus_estimate() {
    let consensus = chain_of(&make_headers(basalt_chain::GENESIS_HASH, 30, 6));
    let (_loop_, handle, _log, _db, _dialer) = spawn_loop(consensus, NodeConfig::default());
    let (tx, rx) = crossbeam_channel::bounded(1);
    handle.api_get_hashrate(
        Box::new(move |info| {
            let _ = tx.send(info);
        }),
        10,
    );
    let info = rx.recv_timeout(Duration::from_secs(5)).expect("hashrate");
    assert_eq!(info.n_blocks, 10);
    assert!(info.estimate > 0.0);
}

#[test]
fn synced_flag_published_to_peer_db() {
    let (_loop_, handle, _log, peer_db, _dialer) =
        spawn_loop(HeaderChain::new(), NodeConfig::default());
    // force one idle pass so the initial "not synced" edge is published
    inspect(&handle, |_| ());
    let peer = TestPeer::new(16);
    init_peer(&handle, &peer, &HeaderChain::new());
    inspect(&handle, |_| ());
    let synced = peer_db.synced.lock().expect("synced").clone();
    assert_eq!(synced.first(), Some(&false));
    assert_eq!(synced.last(), Some(&true));
}

#[test]
fn shutdown_closes_all_peers() {
    let (eventloop, handle, _log, _db, _dialer) =
        spawn_loop(HeaderChain::new(), NodeConfig::default());
    let peer = TestPeer::new(17);
    init_peer(&handle, &peer, &HeaderChain::new());
    assert!(inspect(&handle, |i| i.peer_exists(17)));
    eventloop.shutdown_join(99);
    assert_eq!(peer.close_reason(Duration::from_secs(5)), Some(99));
    // the loop is gone: no further events are accepted
    assert!(!handle.async_process(peer.link.clone()));
}
