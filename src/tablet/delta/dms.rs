// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The delta memstore: REDO mutations awaiting flush, ordered by
//! (row id, timestamp, arrival).

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::RwLock;

use super::RowChange;
use crate::types::Timestamp;

type DmsKey = (u32, Timestamp, u64);

struct DmsInner {
    entries: BTreeMap<DmsKey, RowChange>,
    approx_bytes: usize,
    next_seq: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

/// In-memory REDO store for one rowset. Lookups scan a row's range;
/// flushing drains everything in file order.
pub struct DeltaMemStore {
    id: u64,
    inner: RwLock<DmsInner>,
    created_at: Instant,
}

impl DeltaMemStore {
    pub fn new(id: u64) -> DeltaMemStore {
        DeltaMemStore {
            id,
            inner: RwLock::new(DmsInner {
                entries: BTreeMap::new(),
                approx_bytes: 0,
                next_seq: 0,
                min_timestamp: Timestamp::MAX,
                max_timestamp: Timestamp::MIN,
            }),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn update(&self, row_id: u32, timestamp: Timestamp, change: RowChange) {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.approx_bytes += 16 + change.encode().len();
        inner.min_timestamp = inner.min_timestamp.min(timestamp);
        inner.max_timestamp = inner.max_timestamp.max(timestamp);
        inner.entries.insert((row_id, timestamp, seq), change);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn approx_size_bytes(&self) -> usize {
        self.inner.read().approx_bytes
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.inner.read().min_timestamp
    }

    pub fn max_timestamp(&self) -> Timestamp {
        self.inner.read().max_timestamp
    }

    /// The row's mutations visible at `snapshot`, in commit order.
    pub fn collect_for_row(&self, row_id: u32, snapshot: Timestamp) -> Vec<(Timestamp, RowChange)> {
        let inner = self.inner.read();
        inner
            .entries
            .range((row_id, Timestamp::MIN, 0)..=(row_id, Timestamp::MAX, u64::MAX))
            .filter(|((_, ts, _), _)| *ts < snapshot)
            .map(|((_, ts, _), change)| (*ts, change.clone()))
            .collect()
    }

    /// Whether the row's latest visible liveness change is a delete.
    pub fn check_row_deleted(&self, row_id: u32, snapshot: Timestamp) -> Option<bool> {
        let mutations = self.collect_for_row(row_id, snapshot);
        for (_, change) in mutations.iter().rev() {
            match change {
                RowChange::Delete => return Some(true),
                RowChange::Reinsert(_) => return Some(false),
                RowChange::Update(_) => {}
            }
        }
        None
    }

    /// Drains every entry in (row asc, timestamp desc) order, the REDO
    /// file layout.
    pub fn snapshot_for_flush(&self) -> Vec<(u32, Timestamp, RowChange)> {
        let inner = self.inner.read();
        let mut out: Vec<(u32, Timestamp, RowChange)> = inner
            .entries
            .iter()
            .map(|((row, ts, _), change)| (*row, *ts, change.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::delta::ColumnUpdate;
    use crate::types::Value;

    fn update(v: i64) -> RowChange {
        RowChange::Update(vec![ColumnUpdate {
            column_id: 1,
            value: Value::I64(v),
        }])
    }

    #[test]
    fn test_collect_respects_snapshot() {
        let dms = DeltaMemStore::new(0);
        dms.update(7, Timestamp(10), update(1));
        dms.update(7, Timestamp(20), update(2));
        dms.update(8, Timestamp(15), update(3));
        assert_eq!(dms.collect_for_row(7, Timestamp(15)).len(), 1);
        assert_eq!(dms.collect_for_row(7, Timestamp(100)).len(), 2);
        assert_eq!(dms.collect_for_row(9, Timestamp(100)).len(), 0);
    }

    #[test]
    fn test_check_row_deleted() {
        let dms = DeltaMemStore::new(0);
        assert_eq!(dms.check_row_deleted(1, Timestamp::MAX), None);
        dms.update(1, Timestamp(5), RowChange::Delete);
        assert_eq!(dms.check_row_deleted(1, Timestamp::MAX), Some(true));
        // Not yet visible at an older snapshot.
        assert_eq!(dms.check_row_deleted(1, Timestamp(5)), None);
        dms.update(1, Timestamp(6), RowChange::Reinsert(vec![]));
        assert_eq!(dms.check_row_deleted(1, Timestamp::MAX), Some(false));
    }

    #[test]
    fn test_flush_snapshot_order() {
        let dms = DeltaMemStore::new(0);
        dms.update(2, Timestamp(10), update(1));
        dms.update(1, Timestamp(20), update(2));
        dms.update(1, Timestamp(30), update(3));
        let drained = dms.snapshot_for_flush();
        let keys: Vec<(u32, u64)> = drained.iter().map(|(r, ts, _)| (*r, ts.0)).collect();
        // Row asc, then timestamp desc within the row.
        assert_eq!(keys, vec![(1, 30), (1, 20), (2, 10)]);
    }
}
