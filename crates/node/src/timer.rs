use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    Connect,
    SendPing { conn_id: u64 },
    CloseNoPong { conn_id: u64 },
    CloseNoReply { conn_id: u64 },
    Expire { conn_id: u64 },
    ThrottledSend { conn_id: u64 },
}

pub type TimerKey = (Instant, u64);

// Deadline-ordered timer wheel. Keys stay unique via a sequence counter, so
// cancellation is a map removal and stays idempotent after the event fired.
#[derive(Debug, Default)]
pub struct Timer {
    entries: BTreeMap<TimerKey, TimerEvent>,
    seq: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, event: TimerEvent) -> TimerKey {
        self.seq += 1;
        let key = (deadline, self.seq);
        self.entries.insert(key, event);
        key
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut expired = Vec::new();
        while let Some((key, event)) = self.entries.pop_first() {
            if key.0 > now {
                self.entries.insert(key, event);
                break;
            }
            expired.push(event);
        }
        expired
    }

    pub fn next(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
