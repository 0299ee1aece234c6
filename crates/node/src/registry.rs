use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ErrorCode;
use crate::peer::PeerState;
use crate::timer::TimerKey;
use crate::transport::Link;
use crate::wire::sockaddr_v4;

const MAX_KNOWN_ADDRESSES: usize = 1024;

// Live peers, keyed by the transport-assigned id. BTreeMap iteration gives
// the earlier-registered-peer-wins tie-break for free.
#[derive(Default)]
pub struct Registry {
    peers: BTreeMap<u64, PeerState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link: Arc<Link>, init_timer: TimerKey) -> Result<(), ErrorCode> {
        let id = link.id();
        if self.peers.contains_key(&id) {
            return Err(ErrorCode::DuplicateCon);
        }
        self.peers.insert(id, PeerState::new(link, init_timer));
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&PeerState> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut PeerState> {
        self.peers.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.peers.keys().copied().collect()
    }

    pub fn initialized_ids(&self) -> Vec<u64> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.initialized() && !peer.link.erased())
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn initialized_len(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.initialized() && !peer.link.erased())
            .count()
    }

    // Drop records whose link was erased this cycle.
    pub fn garbage_collect(&mut self) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, peer| !peer.link.erased());
        before - self.peers.len()
    }
}

#[derive(Debug)]
struct DialSlot {
    due: Option<Instant>,
    backoff: Duration,
    pinned: bool,
    verified: bool,
    connected: bool,
}

// Outbound dial schedule: configured and gossiped addresses with
// exponential backoff on failure, pins that survive backoff, and the
// verified set sampled into pong replies.
pub struct DialPlanner {
    slots: HashMap<SocketAddr, DialSlot>,
    backoff_start: Duration,
    backoff_cap: Duration,
}

impl DialPlanner {
    pub fn new(
        connect: &[SocketAddr],
        backoff_start: Duration,
        backoff_cap: Duration,
        now: Instant,
    ) -> Self {
        let mut planner = Self {
            slots: HashMap::new(),
            backoff_start,
            backoff_cap,
        };
        for &addr in connect {
            planner.slots.insert(
                addr,
                DialSlot {
                    due: Some(now),
                    backoff: backoff_start,
                    pinned: false,
                    verified: false,
                    connected: false,
                },
            );
        }
        planner
    }

    fn fresh_slot(&self, now: Instant) -> DialSlot {
        DialSlot {
            due: Some(now),
            backoff: self.backoff_start,
            pinned: false,
            verified: false,
            connected: false,
        }
    }

    pub fn pin(&mut self, addr: SocketAddr, now: Instant) {
        let fresh = self.fresh_slot(now);
        let slot = self.slots.entry(addr).or_insert(fresh);
        slot.pinned = true;
        if slot.due.is_none() && !slot.connected {
            slot.due = Some(now);
        }
    }

    pub fn unpin(&mut self, addr: SocketAddr) {
        if let Some(slot) = self.slots.get_mut(&addr) {
            slot.pinned = false;
        }
    }

    pub fn queue_candidates(&mut self, addrs: &[SocketAddrV4], now: Instant) {
        for addr in addrs {
            if self.slots.len() >= MAX_KNOWN_ADDRESSES {
                return;
            }
            let addr = SocketAddr::V4(*addr);
            if !self.slots.contains_key(&addr) {
                let slot = self.fresh_slot(now);
                self.slots.insert(addr, slot);
            }
        }
    }

    pub fn pop_connect(&mut self, now: Instant) -> Vec<SocketAddr> {
        let mut due = Vec::new();
        for (&addr, slot) in self.slots.iter_mut() {
            if slot.connected {
                continue;
            }
            if let Some(at) = slot.due {
                if at <= now {
                    // reschedule as a retry guard until an outcome arrives
                    slot.due = Some(now + slot.backoff);
                    due.push(addr);
                }
            }
        }
        due
    }

    pub fn on_failed_outbound(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&addr) else {
            return false;
        };
        // pinned addresses keep the aggressive redial cadence
        slot.backoff = if slot.pinned {
            self.backoff_start
        } else {
            (slot.backoff * 2).min(self.backoff_cap)
        };
        slot.due = Some(now + slot.backoff);
        true
    }

    pub fn on_established(&mut self, addr: SocketAddr, now: Instant) {
        let fresh = self.fresh_slot(now);
        let slot = self.slots.entry(addr).or_insert(fresh);
        slot.connected = true;
        slot.verified = true;
        slot.backoff = self.backoff_start;
        slot.due = None;
    }

    pub fn on_disconnected(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(slot) = self.slots.get_mut(&addr) {
            slot.connected = false;
            slot.due = Some(now + slot.backoff);
        }
    }

    pub fn wakeup_time(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| !slot.connected)
            .filter_map(|slot| slot.due)
            .min()
    }

    pub fn sample_verified<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<SocketAddrV4> {
        let verified: Vec<SocketAddrV4> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.verified)
            .filter_map(|(&addr, _)| sockaddr_v4(addr))
            .collect();
        verified
            .choose_multiple(rng, n.min(verified.len()))
            .copied()
            .collect()
    }
}
