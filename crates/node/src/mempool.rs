use std::collections::HashMap;

use basalt_primitives::{Height, TxId};
use rand::seq::SliceRandom;
use rand::Rng;

// Local copy of the chain server's mempool, kept in sync through its log.
// `transaction_height` is the chain height the transaction's nonce pins to;
// it drives the gossip subscription bounds below.
#[derive(Clone, Debug, PartialEq)]
pub struct MempoolTx {
    pub txid: TxId,
    pub transaction_height: Height,
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum LogAction {
    Put(MempoolTx),
    Erase(TxId),
}

pub type Log = Vec<LogAction>;

#[derive(Default)]
pub struct MempoolCache {
    entries: HashMap<TxId, MempoolTx>,
}

impl MempoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_log(&mut self, log: &Log) {
        for action in log {
            match action {
                LogAction::Put(tx) => {
                    self.entries.insert(tx.txid, tx.clone());
                }
                LogAction::Erase(txid) => {
                    self.entries.remove(txid);
                }
            }
        }
    }

    pub fn get(&self, txid: &TxId) -> Option<&MempoolTx> {
        self.entries.get(txid)
    }

    pub fn filter_new(&self, txids: &[TxId]) -> Vec<TxId> {
        txids
            .iter()
            .filter(|txid| !self.entries.contains_key(*txid))
            .copied()
            .collect()
    }

    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<TxId> {
        let all: Vec<TxId> = self.entries.keys().copied().collect();
        all.choose_multiple(rng, n.min(all.len())).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Sort freshly inserted entries the way subscriptions are keyed.
pub fn sort_new_entries(log: &Log) -> Vec<(Height, TxId)> {
    let mut entries: Vec<(Height, TxId)> = log
        .iter()
        .filter_map(|action| match action {
            LogAction::Put(tx) => Some((tx.transaction_height, tx.txid)),
            LogAction::Erase(_) => None,
        })
        .collect();
    entries.sort();
    entries
}

// Each peer subscribes with the lowest transaction height it is known to
// already have; it lacks exactly the sorted prefix of entries below that
// bound. Returns (conn_id, end_index) pairs; peers with an empty slice are
// skipped.
pub fn notify_slices(
    entries: &[(Height, TxId)],
    subscriptions: &[(Height, u64)],
) -> Vec<(u64, usize)> {
    let mut out = Vec::new();
    for &(bound, conn_id) in subscriptions {
        let end = entries.partition_point(|&(height, _)| height < bound);
        if end > 0 {
            out.push((conn_id, end));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u8, height: Height) -> MempoolTx {
        MempoolTx {
            txid: [id; 32],
            transaction_height: height,
            raw: vec![id, id],
        }
    }

    #[test]
    fn log_applies_puts_and_erases() {
        let mut cache = MempoolCache::new();
        cache.apply_log(&vec![
            LogAction::Put(tx(1, 5)),
            LogAction::Put(tx(2, 6)),
            LogAction::Erase([1; 32]),
        ]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&[2; 32]).is_some());
        assert_eq!(
            cache.filter_new(&[[1; 32], [2; 32], [3; 32]]),
            vec![[1; 32], [3; 32]]
        );
    }

    #[test]
    fn sample_is_bounded() {
        let mut cache = MempoolCache::new();
        cache.apply_log(&vec![LogAction::Put(tx(1, 5)), LogAction::Put(tx(2, 6))]);
        let mut rng = rand::thread_rng();
        assert_eq!(cache.sample(10, &mut rng).len(), 2);
        assert_eq!(cache.sample(1, &mut rng).len(), 1);
    }

    #[test]
    fn slices_follow_subscription_bounds() {
        let log = vec![
            LogAction::Put(tx(3, 12)),
            LogAction::Put(tx(1, 10)),
            LogAction::Put(tx(2, 10)),
            LogAction::Erase([9; 32]),
        ];
        let entries = sort_new_entries(&log);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, 10);

        // peer 7 has everything from height 11 up, peer 8 from 13, peer 9
        // already has everything
        let slices = notify_slices(&entries, &[(11, 7), (13, 8), (10, 9)]);
        assert_eq!(slices, vec![(7, 2), (8, 3)]);
    }

    #[test]
    fn no_entries_means_no_notifications() {
        assert!(notify_slices(&[], &[(5, 1)]).is_empty());
    }
}
