//! Bounded, deduplicated transaction feed
//!
//! All mutations happen under one mutex that is never held across an await.
//! Each mutation publishes a fresh snapshot on a broadcast channel, so
//! observers see whole lists only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::debug;

use super::record::{TransactionRecord, TxStatus};

/// Default number of records kept
pub const DEFAULT_CAPACITY: usize = 15;

/// Feed snapshot shared with readers
pub type FeedSnapshot = Arc<[TransactionRecord]>;

struct FeedState {
    records: Vec<TransactionRecord>,
    last_stamp: u64,
}

/// In-memory feed of the most recent transactions
pub struct FeedStore {
    capacity: usize,
    state: Mutex<FeedState>,
    updates: broadcast::Sender<FeedSnapshot>,
}

impl FeedStore {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(100);
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(FeedState {
                records: Vec::new(),
                last_stamp: 0,
            }),
            updates,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        // A panic while holding the lock leaves a consistent Vec behind, keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next observation stamp in milliseconds.
    ///
    /// Strictly greater than every stamp handed out before, even if the wall
    /// clock goes backwards.
    pub fn stamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut state = self.lock();
        let stamp = now.max(state.last_stamp + 1);
        state.last_stamp = stamp;
        stamp
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.lock().records.clone().into()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hash: &str) -> Option<TransactionRecord> {
        self.lock()
            .records
            .iter()
            .find(|r| !r.is_sentinel() && r.hash == hash)
            .cloned()
    }

    /// Receive a snapshot after every mutation
    pub fn subscribe(&self) -> broadcast::Receiver<FeedSnapshot> {
        self.updates.subscribe()
    }

    /// Merge the result of a full refresh.
    ///
    /// The batch goes ahead of what is already held; hashes the store has
    /// already seen confirmed stay confirmed. When the pending pool was read,
    /// `live_pending` holds every hash it reported and held pending records
    /// missing from it are dropped.
    pub fn apply_refresh(
        &self,
        batch: Vec<TransactionRecord>,
        live_pending: Option<&HashSet<String>>,
    ) -> FeedSnapshot {
        let snapshot = {
            let mut state = self.lock();

            if let Some(live) = live_pending {
                let before = state.records.len();
                state
                    .records
                    .retain(|r| !r.is_pending() || (!r.is_sentinel() && live.contains(&r.hash)));
                let dropped = before - state.records.len();
                if dropped > 0 {
                    debug!(dropped, "Pending transactions left the pool");
                }
            }

            let mut combined = batch;
            for record in combined.iter_mut() {
                if record.is_pending() {
                    if let Some(known) = state
                        .records
                        .iter()
                        .find(|r| r.status == TxStatus::Confirmed && same_hash(r, record))
                    {
                        record.status = TxStatus::Confirmed;
                        record.block_number = known.block_number;
                        record.block_timestamp = known.block_timestamp;
                    }
                }
            }
            combined.append(&mut state.records);

            state.records = self.settle(combined);
            Self::freeze(&state.records)
        };
        self.publish(snapshot)
    }

    /// Merge the transactions of a newly mined block.
    ///
    /// Pending records with a matching hash flip to confirmed in place before
    /// the block's records are prepended. Returns the number flipped.
    pub fn merge_confirmed(&self, block: Vec<TransactionRecord>) -> (usize, FeedSnapshot) {
        let (flipped, snapshot) = {
            let mut state = self.lock();

            let mut flipped = 0;
            for existing in state.records.iter_mut().filter(|r| r.is_pending()) {
                if let Some(confirmed) = block.iter().find(|b| same_hash(b, existing)) {
                    existing.status = TxStatus::Confirmed;
                    existing.block_number = confirmed.block_number;
                    existing.block_timestamp = confirmed.block_timestamp;
                    flipped += 1;
                }
            }

            let mut combined = block;
            combined.append(&mut state.records);
            state.records = self.settle(combined);
            (flipped, Self::freeze(&state.records))
        };
        if flipped > 0 {
            debug!(flipped, "Pending transactions confirmed");
        }
        (flipped, self.publish(snapshot))
    }

    /// Prepend a pending record unless its hash is already held
    pub fn insert_pending(&self, record: TransactionRecord) -> bool {
        let snapshot = {
            let mut state = self.lock();
            if !record.is_sentinel() && state.records.iter().any(|r| same_hash(r, &record)) {
                return false;
            }
            let mut combined = vec![record];
            combined.append(&mut state.records);
            state.records = self.settle(combined);
            Self::freeze(&state.records)
        };
        self.publish(snapshot);
        true
    }

    /// Dedup (first wins), order by recency, bound to capacity
    fn settle(&self, combined: Vec<TransactionRecord>) -> Vec<TransactionRecord> {
        let mut seen = HashSet::with_capacity(combined.len());
        let mut records: Vec<TransactionRecord> = combined
            .into_iter()
            .filter(|r| r.is_sentinel() || seen.insert(r.hash.clone()))
            .collect();

        // Stable, so pending stays ahead of confirmed within a batch
        records.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        records.truncate(self.capacity);
        records
    }

    fn freeze(records: &[TransactionRecord]) -> FeedSnapshot {
        records.to_vec().into()
    }

    fn publish(&self, snapshot: FeedSnapshot) -> FeedSnapshot {
        // No receivers is fine
        let _ = self.updates.send(Arc::clone(&snapshot));
        snapshot
    }
}

impl Default for FeedStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn same_hash(a: &TransactionRecord, b: &TransactionRecord) -> bool {
    !a.is_sentinel() && !b.is_sentinel() && a.hash == b.hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::record::SENTINEL_HASH;

    fn record(hash: &str, status: TxStatus, observed_at: u64) -> TransactionRecord {
        TransactionRecord {
            hash: hash.to_string(),
            raw_hash: None,
            from: "0x1".into(),
            to: Some("0x2".into()),
            value: 1,
            observed_at,
            block_timestamp: None,
            status,
            block_number: match status {
                TxStatus::Pending => None,
                TxStatus::Confirmed => Some(1),
            },
        }
    }

    #[test]
    fn test_stamp_is_strictly_increasing() {
        let store = FeedStore::new(3);
        let a = store.stamp();
        let b = store.stamp();
        let c = store.stamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_refresh_dedups_first_wins_and_truncates() {
        let store = FeedStore::new(3);
        let snapshot = store.apply_refresh(
            vec![
                record("0xa", TxStatus::Pending, 10),
                record("0xa", TxStatus::Confirmed, 10),
                record("0xb", TxStatus::Confirmed, 10),
                record("0xc", TxStatus::Confirmed, 10),
                record("0xd", TxStatus::Confirmed, 10),
            ],
            None,
        );

        let hashes: Vec<_> = snapshot.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xa", "0xb", "0xc"]);
        assert_eq!(snapshot[0].status, TxStatus::Pending);
    }

    #[test]
    fn test_refresh_never_downgrades_confirmed() {
        let store = FeedStore::new(5);
        store.apply_refresh(vec![record("0xa", TxStatus::Confirmed, 1)], None);
        let live = HashSet::from(["0xa".to_string()]);
        let snapshot = store.apply_refresh(vec![record("0xa", TxStatus::Pending, 2)], Some(&live));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TxStatus::Confirmed);
        assert_eq!(snapshot[0].block_number, Some(1));
    }

    #[test]
    fn test_refresh_drops_pending_missing_from_pool() {
        let store = FeedStore::new(5);
        store.apply_refresh(
            vec![
                record("0xa", TxStatus::Pending, 1),
                record("0xb", TxStatus::Pending, 1),
                record("0xc", TxStatus::Confirmed, 1),
            ],
            None,
        );

        // Pool unreadable: nothing is known to have left
        store.apply_refresh(Vec::new(), None);
        assert_eq!(store.len(), 3);

        let live = HashSet::from(["0xb".to_string()]);
        let snapshot = store.apply_refresh(Vec::new(), Some(&live));
        let hashes: Vec<_> = snapshot.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xb", "0xc"]);
    }

    #[test]
    fn test_merge_confirmed_flips_pending_in_place() {
        let store = FeedStore::new(5);
        store.insert_pending(record("0xa", TxStatus::Pending, 1));
        let (flipped, snapshot) = store.merge_confirmed(vec![
            record("0xa", TxStatus::Confirmed, 2),
            record("0xb", TxStatus::Confirmed, 2),
        ]);
        assert_eq!(flipped, 1);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|r| r.status == TxStatus::Confirmed));
    }

    #[test]
    fn test_insert_pending_skips_known_hash() {
        let store = FeedStore::new(5);
        assert!(store.insert_pending(record("0xa", TxStatus::Pending, 1)));
        assert!(!store.insert_pending(record("0xa", TxStatus::Pending, 2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sentinels_never_collide() {
        let store = FeedStore::new(5);
        store.apply_refresh(
            vec![
                record(SENTINEL_HASH, TxStatus::Pending, 1),
                record(SENTINEL_HASH, TxStatus::Pending, 1),
            ],
            None,
        );
        assert!(store.insert_pending(record(SENTINEL_HASH, TxStatus::Pending, 2)));
        assert_eq!(store.len(), 3);
        assert!(store.get(SENTINEL_HASH).is_none());
    }

    #[test]
    fn test_oldest_evicted_first() {
        let store = FeedStore::new(2);
        store.insert_pending(record("0xa", TxStatus::Pending, 1));
        store.insert_pending(record("0xb", TxStatus::Pending, 2));
        store.insert_pending(record("0xc", TxStatus::Pending, 3));
        let hashes: Vec<_> = store.snapshot().iter().map(|r| r.hash.clone()).collect();
        assert_eq!(hashes, vec!["0xc", "0xb"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_snapshots() {
        let store = FeedStore::new(5);
        let mut rx = store.subscribe();
        store.insert_pending(record("0xa", TxStatus::Pending, 1));
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
