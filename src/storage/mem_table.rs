//! In-memory time-series engine.
//!
//! Per index, a concurrent skip map from user key to [`KeyEntry`]; each
//! `KeyEntry` holds one skip list per ts column, keyed by the bitwise-not of
//! the timestamp so ascending map order is newest-first time order. Values
//! are `Arc`-shared across every index entry of the same record.
//!
//! Iterators are stateless cursors: every step issues a fresh bounded range
//! query, so readers never hold a position into memory that GC might unlink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::binlog::{LogEntry, OpType};
use crate::error::Result;
use crate::meta::{IndexDef, TableMeta, TtlDesc};
use crate::storage::iterator::{TraverseIterator, TsIterator};
use crate::storage::ttl::is_expired;
use crate::storage::{TableCore, ValueRef};

/// Entries of one user key: one newest-first skip list per ts column.
pub struct KeyEntry {
    slists: Vec<SkipMap<u64, ValueRef>>,
}

impl KeyEntry {
    fn new(ts_cnt: usize) -> Self {
        Self {
            slists: (0..ts_cnt.max(1)).map(|_| SkipMap::new()).collect(),
        }
    }

    fn slist(&self, slot: usize) -> Option<&SkipMap<u64, ValueRef>> {
        self.slists.get(slot)
    }

    fn entry_cnt(&self) -> u64 {
        self.slists.iter().map(|s| s.len() as u64).sum()
    }

    fn is_empty(&self) -> bool {
        self.slists.iter().all(|s| s.is_empty())
    }
}

struct IndexState {
    def: IndexDef,
    ready: AtomicBool,
    entries: Arc<SkipMap<String, Arc<KeyEntry>>>,
    idx_cnt: AtomicU64,
}

impl IndexState {
    fn slot_cnt(&self) -> usize {
        self.def.ts_cols.len().max(1)
    }
}

pub struct MemTable {
    core: TableCore,
    indexes: Vec<IndexState>,
    record_cnt: AtomicU64,
    record_byte_size: AtomicU64,
}

impl MemTable {
    pub fn new(meta: TableMeta) -> Result<Self> {
        let indexes = meta
            .index_defs()
            .into_iter()
            .map(|def| IndexState {
                def,
                ready: AtomicBool::new(true),
                entries: Arc::new(SkipMap::new()),
                idx_cnt: AtomicU64::new(0),
            })
            .collect();
        Ok(Self {
            core: TableCore::new(meta),
            indexes,
            record_cnt: AtomicU64::new(0),
            record_byte_size: AtomicU64::new(0),
        })
    }

    pub fn core(&self) -> &TableCore {
        &self.core
    }

    pub fn idx_cnt(&self) -> usize {
        self.indexes.len()
    }

    pub fn index_ready(&self, id: u32) -> bool {
        self.indexes
            .get(id as usize)
            .map(|i| i.ready.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Single-key put against the first index; the timestamp lands in every
    /// ts slot of that index.
    pub fn put(&self, pk: &str, ts: u64, value: &[u8]) -> Result<()> {
        let value: ValueRef = Arc::new(value.to_vec());
        let index = &self.indexes[0];
        self.put_slots(index, pk, &[(ts, None)], &value)?;
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
        self.record_byte_size.fetch_add(value.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Multi-index put: one write per dimension, all slots stamped with `ts`.
    pub fn put_dims(&self, dims: &[(String, u32)], ts: u64, value: &[u8]) -> Result<()> {
        self.check_dims(dims)?;
        let value: ValueRef = Arc::new(value.to_vec());
        for (key, idx) in dims {
            let index = &self.indexes[*idx as usize];
            self.put_slots(index, key, &[(ts, None)], &value)?;
        }
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
        self.record_byte_size.fetch_add(value.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Multi-index, multi-ts put. Each index takes only the ts dimensions
    /// wired into it by the schema.
    pub fn put_ts_dims(
        &self,
        dims: &[(String, u32)],
        ts_dims: &[(u64, u32)],
        value: &[u8],
    ) -> Result<()> {
        self.check_dims(dims)?;
        if ts_dims.is_empty() {
            return errinput!("ts dimensions are empty");
        }
        let value: ValueRef = Arc::new(value.to_vec());
        for (key, idx) in dims {
            let index = &self.indexes[*idx as usize];
            let mut slots: Vec<(u64, Option<usize>)> = Vec::new();
            for (ts, ts_id) in ts_dims {
                if index.def.ts_cols.is_empty() {
                    if *ts_id == 0 {
                        slots.push((*ts, Some(0)));
                    }
                } else if let Some(slot) =
                    index.def.ts_cols.iter().position(|id| id == ts_id)
                {
                    slots.push((*ts, Some(slot)));
                }
            }
            if !slots.is_empty() {
                self.put_slots(index, key, &slots, &value)?;
            }
        }
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
        self.record_byte_size.fetch_add(value.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn check_dims(&self, dims: &[(String, u32)]) -> Result<()> {
        if dims.is_empty() {
            return errinput!("dimensions are empty");
        }
        for (key, idx) in dims {
            if key.is_empty() {
                return errinput!("empty dimension key for idx {idx}");
            }
            if *idx as usize >= self.indexes.len() {
                return errinput!("invalid dimension idx {idx}");
            }
        }
        Ok(())
    }

    /// `slots`: `(ts, slot)` pairs; `None` slot broadcasts to every slot.
    fn put_slots(
        &self,
        index: &IndexState,
        pk: &str,
        slots: &[(u64, Option<usize>)],
        value: &ValueRef,
    ) -> Result<()> {
        let entry = index
            .entries
            .get_or_insert_with(pk.to_string(), || Arc::new(KeyEntry::new(index.slot_cnt())));
        let key_entry = entry.value();
        for (ts, slot) in slots {
            match slot {
                Some(slot) => {
                    if let Some(slist) = key_entry.slist(*slot) {
                        if slist.get(&!*ts).is_none() {
                            index.idx_cnt.fetch_add(1, Ordering::SeqCst);
                        }
                        slist.insert(!*ts, value.clone());
                    }
                }
                None => {
                    for slist in &key_entry.slists {
                        if slist.get(&!*ts).is_none() {
                            index.idx_cnt.fetch_add(1, Ordering::SeqCst);
                        }
                        slist.insert(!*ts, value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a log entry. Leader writes, follower replication, snapshot
    /// recovery and binlog replay all come through here.
    pub fn apply_entry(&self, entry: &LogEntry) -> Result<()> {
        match entry.op {
            OpType::Delete => {
                let (pk, idx) = match entry.dimensions.first() {
                    Some(dim) if !dim.key.is_empty() => (dim.key.as_str(), dim.idx),
                    _ => (entry.pk.as_str(), 0),
                };
                self.delete(pk, idx)?;
                Ok(())
            }
            OpType::Put => {
                if !entry.ts_dimensions.is_empty() && !entry.dimensions.is_empty() {
                    let dims: Vec<(String, u32)> = entry
                        .dimensions
                        .iter()
                        .map(|d| (d.key.clone(), d.idx))
                        .collect();
                    let ts_dims: Vec<(u64, u32)> =
                        entry.ts_dimensions.iter().map(|d| (d.ts, d.idx)).collect();
                    self.put_ts_dims(&dims, &ts_dims, &entry.value)
                } else if !entry.dimensions.is_empty() {
                    let dims: Vec<(String, u32)> = entry
                        .dimensions
                        .iter()
                        .map(|d| (d.key.clone(), d.idx))
                        .collect();
                    self.put_dims(&dims, entry.ts, &entry.value)
                } else {
                    self.put(&entry.pk, entry.ts, &entry.value)
                }
            }
        }
    }

    /// Drop every entry of `pk` under one index.
    pub fn delete(&self, pk: &str, idx: u32) -> Result<bool> {
        let index = match self.indexes.get(idx as usize) {
            Some(index) => index,
            None => return errinput!("invalid index id {idx}"),
        };
        match index.entries.remove(pk) {
            Some(entry) => {
                let removed = entry.value().entry_cnt();
                index.idx_cnt.fetch_sub(removed, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn ts_iterator(
        &self,
        idx: u32,
        slot: usize,
        pk: &str,
    ) -> Result<Box<dyn TsIterator + Send>> {
        let index = match self.indexes.get(idx as usize) {
            Some(index) => index,
            None => return errinput!("invalid index id {idx}"),
        };
        if slot >= index.slot_cnt() {
            return errinput!("invalid ts slot {slot} for index {idx}");
        }
        let entry = index.entries.get(pk).map(|e| e.value().clone());
        Ok(Box::new(MemTsIterator { entry, slot, cur: None }))
    }

    pub fn traverse_iterator(
        &self,
        idx: u32,
        slot: usize,
    ) -> Result<Box<dyn TraverseIterator + Send>> {
        let index = match self.indexes.get(idx as usize) {
            Some(index) => index,
            None => return errinput!("invalid index id {idx}"),
        };
        if slot >= index.slot_cnt() {
            return errinput!("invalid ts slot {slot} for index {idx}");
        }
        let ts_id = index.def.ts_cols.get(slot).copied().unwrap_or(0);
        let ttl = self.core.ttl(ts_id);
        Ok(Box::new(MemTraverseIterator {
            entries: index.entries.clone(),
            slot,
            ttl,
            expire_time: self.core.expire_time(ttl.abs_ttl),
            expire_enabled: self.core.expire_enabled(),
            cur_pk: None,
            cur: None,
            per_key_steps: 0,
            steps: 0,
        }))
    }

    pub fn get_count(&self, idx: u32, slot: usize, pk: &str) -> Result<u64> {
        let index = match self.indexes.get(idx as usize) {
            Some(index) => index,
            None => return errinput!("invalid index id {idx}"),
        };
        Ok(index
            .entries
            .get(pk)
            .and_then(|e| e.value().slist(slot).map(|s| s.len() as u64))
            .unwrap_or(0))
    }

    /// One GC pass: unlink the expired suffix of every key, reclaim inactive
    /// indexes, drop emptied keys. Returns the number of evicted entries.
    pub fn sched_gc(&self) -> Result<u64> {
        if !self.core.expire_enabled() {
            return Ok(0);
        }
        let mut evicted = 0u64;
        for index in &self.indexes {
            if !index.ready.load(Ordering::SeqCst) {
                // Index was deleted; reclaim everything under it.
                while let Some(entry) = index.entries.front() {
                    let key_entry = entry.value().clone();
                    index.entries.remove(entry.key());
                    evicted += key_entry.entry_cnt();
                }
                index.idx_cnt.store(0, Ordering::SeqCst);
                continue;
            }
            for slot in 0..index.slot_cnt() {
                let ts_id = index.def.ts_cols.get(slot).copied().unwrap_or(0);
                let ttl = self.core.ttl(ts_id);
                if ttl.abs_ttl == 0 && ttl.lat_ttl == 0 {
                    continue;
                }
                let expire_time = self.core.expire_time(ttl.abs_ttl);
                evicted += self.gc_index_slot(index, slot, ttl, expire_time);
            }
            // Drop keys that were fully emptied.
            let empty_keys: Vec<String> = index
                .entries
                .iter()
                .filter(|e| e.value().is_empty())
                .map(|e| e.key().clone())
                .collect();
            for key in empty_keys {
                index.entries.remove(&key);
            }
        }
        Ok(evicted)
    }

    fn gc_index_slot(
        &self,
        index: &IndexState,
        slot: usize,
        ttl: TtlDesc,
        expire_time: u64,
    ) -> u64 {
        let mut evicted = 0u64;
        for entry in index.entries.iter() {
            let key_entry = entry.value();
            let slist = match key_entry.slist(slot) {
                Some(slist) => slist,
                None => continue,
            };
            let mut steps = 0u64;
            let mut doomed: Vec<u64> = Vec::new();
            for node in slist.iter() {
                let ts = !*node.key();
                if is_expired(ttl.ttl_type, ts, steps, expire_time, ttl.lat_ttl) {
                    doomed.push(*node.key());
                }
                steps += 1;
            }
            for key in doomed {
                if slist.remove(&key).is_some() {
                    evicted += 1;
                    index.idx_cnt.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        evicted
    }

    pub fn delete_index(&self, name: &str) -> Result<bool> {
        match self.indexes.iter().find(|i| i.def.name == name) {
            Some(index) => {
                index.ready.store(false, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn record_cnt(&self) -> u64 {
        self.record_cnt.load(Ordering::SeqCst)
    }

    pub fn record_byte_size(&self) -> u64 {
        self.record_byte_size.load(Ordering::SeqCst)
    }

    pub fn record_pk_cnt(&self) -> u64 {
        self.indexes[0].entries.len() as u64
    }

    pub fn record_idx_cnt(&self) -> u64 {
        self.indexes
            .iter()
            .map(|i| i.idx_cnt.load(Ordering::SeqCst))
            .sum()
    }
}

/// Cursor over one key's entries, newest first.
pub struct MemTsIterator {
    entry: Option<Arc<KeyEntry>>,
    slot: usize,
    cur: Option<(u64, ValueRef)>,
}

impl MemTsIterator {
    fn slist(&self) -> Option<&SkipMap<u64, ValueRef>> {
        self.entry.as_ref().and_then(|e| e.slist(self.slot))
    }
}

impl TsIterator for MemTsIterator {
    fn seek_to_first(&mut self) {
        self.cur = self
            .slist()
            .and_then(|s| s.front().map(|e| (*e.key(), e.value().clone())));
    }

    fn seek(&mut self, ts: u64) {
        self.cur = self
            .slist()
            .and_then(|s| s.range(!ts..).next().map(|e| (*e.key(), e.value().clone())));
    }

    fn next(&mut self) {
        use std::ops::Bound;
        let Some(cur_key) = self.cur.as_ref().map(|(k, _)| *k) else { return };
        self.cur = self.slist().and_then(|s| {
            s.range((Bound::Excluded(cur_key), Bound::Unbounded))
                .next()
                .map(|e| (*e.key(), e.value().clone()))
        });
    }

    fn valid(&self) -> bool {
        self.cur.is_some()
    }

    fn ts(&self) -> u64 {
        self.cur.as_ref().map(|(k, _)| !*k).unwrap_or(0)
    }

    fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

/// Cursor across all keys of one index. Expired suffixes are skipped using
/// the TTL captured at creation time.
pub struct MemTraverseIterator {
    entries: Arc<SkipMap<String, Arc<KeyEntry>>>,
    slot: usize,
    ttl: TtlDesc,
    expire_time: u64,
    expire_enabled: bool,
    cur_pk: Option<String>,
    cur: Option<(u64, ValueRef)>,
    per_key_steps: u64,
    steps: u64,
}

impl MemTraverseIterator {
    fn entry_expired(&self, ts: u64, steps: u64) -> bool {
        self.expire_enabled && is_expired(self.ttl.ttl_type, ts, steps, self.expire_time, self.ttl.lat_ttl)
    }

    /// First live entry of `pk`, if any.
    fn first_of(&self, pk: &str) -> Option<(u64, ValueRef)> {
        let entry = self.entries.get(pk)?;
        let slist = entry.value().slist(self.slot)?;
        let node = slist.front()?;
        let ts = !*node.key();
        if self.entry_expired(ts, 0) {
            return None;
        }
        Some((*node.key(), node.value().clone()))
    }

    /// Move to the first key at or after `start` (exclusive when `excl`)
    /// that has a live entry.
    fn advance_pk(&mut self, start: Option<&str>, excl: bool) {
        use std::ops::Bound;
        let mut from: Option<String> = start.map(str::to_string);
        let mut exclusive = excl;
        loop {
            let next_pk = match (&from, exclusive) {
                (Some(pk), true) => self
                    .entries
                    .range::<str, _>((Bound::Excluded(pk.as_str()), Bound::Unbounded))
                    .next()
                    .map(|e| e.key().clone()),
                (Some(pk), false) => self
                    .entries
                    .range::<str, _>((Bound::Included(pk.as_str()), Bound::Unbounded))
                    .next()
                    .map(|e| e.key().clone()),
                (None, _) => self.entries.front().map(|e| e.key().clone()),
            };
            let Some(pk) = next_pk else {
                self.cur_pk = None;
                self.cur = None;
                return;
            };
            self.steps += 1;
            if let Some(found) = self.first_of(&pk) {
                self.per_key_steps = 0;
                self.cur_pk = Some(pk);
                self.cur = Some(found);
                return;
            }
            // The key had no live entry; keep walking from after it.
            from = Some(pk);
            exclusive = true;
        }
    }
}

impl TraverseIterator for MemTraverseIterator {
    fn seek_to_first(&mut self) {
        self.advance_pk(None, false);
    }

    fn seek(&mut self, pk: &str, ts: u64) {
        use std::ops::Bound;
        let found_pk = self
            .entries
            .range::<str, _>((Bound::Included(pk), Bound::Unbounded))
            .next()
            .map(|e| e.key().clone());
        match found_pk {
            Some(found) if found == pk => {
                let live = self.entries.get(pk).and_then(|entry| {
                    let slist = entry.value().slist(self.slot)?;
                    // Entries strictly older than ts; count the newer ones
                    // so TTL step accounting stays correct.
                    let newer = slist.range(..=!ts).count() as u64;
                    let node = slist
                        .range((Bound::Excluded(!ts), Bound::Unbounded))
                        .next()?;
                    let node_ts = !*node.key();
                    if self.entry_expired(node_ts, newer) {
                        return None;
                    }
                    Some((newer, (*node.key(), node.value().clone())))
                });
                match live {
                    Some((newer, cur)) => {
                        self.per_key_steps = newer;
                        self.cur_pk = Some(found);
                        self.cur = Some(cur);
                    }
                    None => self.advance_pk(Some(pk), true),
                }
            }
            Some(found) => self.advance_pk(Some(&found), false),
            None => {
                self.cur_pk = None;
                self.cur = None;
            }
        }
    }

    fn next(&mut self) {
        use std::ops::Bound;
        let Some(pk) = self.cur_pk.clone() else { return };
        let Some(cur_key) = self.cur.as_ref().map(|(k, _)| *k) else { return };
        self.steps += 1;
        self.per_key_steps += 1;
        let next = self.entries.get(&pk).and_then(|entry| {
            let slist = entry.value().slist(self.slot)?;
            let node = slist
                .range((Bound::Excluded(cur_key), Bound::Unbounded))
                .next()?;
            let ts = !*node.key();
            if self.entry_expired(ts, self.per_key_steps) {
                return None;
            }
            Some((*node.key(), node.value().clone()))
        });
        match next {
            Some(cur) => self.cur = Some(cur),
            None => self.advance_pk(Some(&pk), true),
        }
    }

    fn valid(&self) -> bool {
        self.cur.is_some()
    }

    fn pk(&self) -> &str {
        self.cur_pk.as_deref().unwrap_or("")
    }

    fn ts(&self) -> u64 {
        self.cur.as_ref().map(|(k, _)| !*k).unwrap_or(0)
    }

    fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ColType, ColumnDesc, ColumnKey, TableMeta, TtlDesc, TtlType};

    fn simple_table() -> MemTable {
        MemTable::new(TableMeta::new("t1", 1, 0)).expect("create failed")
    }

    fn ttl_table(abs: u64, lat: u64, ttl_type: TtlType) -> MemTable {
        let meta = TableMeta::new("t1", 1, 0).ttl(TtlDesc::new(abs, lat, ttl_type));
        MemTable::new(meta).expect("create failed")
    }

    fn multi_index_table() -> MemTable {
        let meta = TableMeta::new("t1", 1, 0)
            .column(ColumnDesc::new("card", ColType::String))
            .column(ColumnDesc::new("mcc", ColType::String))
            .column(ColumnDesc::new("ts1", ColType::Int64).ts_col())
            .column(ColumnDesc::new("ts2", ColType::Int64).ts_col())
            .column_key(ColumnKey::new("card").cols(&["card"]).ts(&["ts1", "ts2"]))
            .column_key(ColumnKey::new("mcc").cols(&["mcc"]).ts(&["ts1"]));
        MemTable::new(meta).expect("create failed")
    }

    fn collect(it: &mut dyn TsIterator) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        it.seek_to_first();
        while it.valid() {
            out.push((it.ts(), it.value().to_vec()));
            it.next();
        }
        out
    }

    #[test]
    fn test_put_and_iterate_newest_first() {
        let table = simple_table();
        table.put("k", 100, b"v1").unwrap();
        table.put("k", 300, b"v3").unwrap();
        table.put("k", 200, b"v2").unwrap();

        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        let got = collect(it.as_mut());
        assert_eq!(
            got,
            vec![(300, b"v3".to_vec()), (200, b"v2".to_vec()), (100, b"v1".to_vec())]
        );
    }

    #[test]
    fn test_seek_lands_at_or_below() {
        let table = simple_table();
        for ts in [100u64, 200, 300] {
            table.put("k", ts, format!("v{ts}").as_bytes()).unwrap();
        }
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        it.seek(250);
        assert!(it.valid());
        assert_eq!(it.ts(), 200);
        it.seek(300);
        assert_eq!(it.ts(), 300);
        it.seek(50);
        assert!(!it.valid());
    }

    #[test]
    fn test_missing_key_iterator_is_invalid() {
        let table = simple_table();
        let mut it = table.ts_iterator(0, 0, "nope").unwrap();
        it.seek_to_first();
        assert!(!it.valid());
    }

    #[test]
    fn test_delete_drops_key() {
        let table = simple_table();
        table.put("k", 100, b"v").unwrap();
        assert!(table.delete("k", 0).unwrap());
        assert!(!table.delete("k", 0).unwrap());
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        it.seek_to_first();
        assert!(!it.valid());
    }

    #[test]
    fn test_ts_dims_land_in_mapped_slots() {
        let table = multi_index_table();
        let dims = vec![("card-1".to_string(), 0u32), ("mcc-1".to_string(), 1u32)];
        let ts_dims = vec![(100u64, 0u32), (900u64, 1u32)];
        table.put_ts_dims(&dims, &ts_dims, b"row").unwrap();

        // card index, slot 0 = ts1, slot 1 = ts2.
        let mut it = table.ts_iterator(0, 0, "card-1").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(100, b"row".to_vec())]);
        let mut it = table.ts_iterator(0, 1, "card-1").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(900, b"row".to_vec())]);

        // mcc index only carries ts1.
        let mut it = table.ts_iterator(1, 0, "mcc-1").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(100, b"row".to_vec())]);
    }

    #[test]
    fn test_gc_absolute_time() {
        let table = ttl_table(1, 0, TtlType::AbsoluteTime);
        let now = table.core().current_time_ms();
        table.put("k", now.saturating_sub(10 * 60 * 1000), b"old").unwrap();
        table.put("k", now, b"new").unwrap();

        let evicted = table.sched_gc().unwrap();
        assert_eq!(evicted, 1);
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        let got = collect(it.as_mut());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"new".to_vec());
    }

    #[test]
    fn test_gc_latest_time_keeps_newest_n() {
        let table = ttl_table(0, 2, TtlType::LatestTime);
        for ts in [100u64, 200, 300, 400] {
            table.put("k", ts, b"v").unwrap();
        }
        let evicted = table.sched_gc().unwrap();
        assert_eq!(evicted, 2);
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        let got: Vec<u64> = collect(it.as_mut()).into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(got, vec![400, 300]);
    }

    #[test]
    fn test_gc_abs_and_lat_requires_both() {
        let table = ttl_table(1, 1, TtlType::AbsAndLat);
        let now = table.core().current_time_ms();
        // Both old, but the newest is inside the count limit so it stays.
        table.put("k", now.saturating_sub(10 * 60 * 1000), b"a").unwrap();
        table.put("k", now.saturating_sub(9 * 60 * 1000), b"b").unwrap();
        let evicted = table.sched_gc().unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(table.get_count(0, 0, "k").unwrap(), 1);
    }

    #[test]
    fn test_gc_is_idempotent() {
        let table = ttl_table(0, 2, TtlType::LatestTime);
        for ts in [100u64, 200, 300, 400] {
            table.put("k", ts, b"v").unwrap();
        }
        assert_eq!(table.sched_gc().unwrap(), 2);
        assert_eq!(table.sched_gc().unwrap(), 0);
        assert_eq!(table.get_count(0, 0, "k").unwrap(), 2);
    }

    #[test]
    fn test_gc_skipped_when_expire_disabled() {
        let table = ttl_table(0, 1, TtlType::LatestTime);
        for ts in [100u64, 200] {
            table.put("k", ts, b"v").unwrap();
        }
        table.core().set_expire(false);
        assert_eq!(table.sched_gc().unwrap(), 0);
        table.core().set_expire(true);
        assert_eq!(table.sched_gc().unwrap(), 1);
    }

    #[test]
    fn test_delete_index_then_gc_reclaims() {
        let table = multi_index_table();
        let dims = vec![("card-1".to_string(), 0u32), ("mcc-1".to_string(), 1u32)];
        let ts_dims = vec![(100u64, 0u32)];
        table.put_ts_dims(&dims, &ts_dims, b"row").unwrap();

        assert!(table.delete_index("mcc").unwrap());
        assert!(!table.index_ready(1));
        assert!(table.sched_gc().unwrap() >= 1);
        assert_eq!(table.get_count(1, 0, "mcc-1").unwrap(), 0);
    }

    #[test]
    fn test_traverse_walks_all_keys() {
        let table = simple_table();
        table.put("a", 100, b"a1").unwrap();
        table.put("a", 200, b"a2").unwrap();
        table.put("b", 300, b"b1").unwrap();

        let mut it = table.traverse_iterator(0, 0).unwrap();
        it.seek_to_first();
        let mut got = Vec::new();
        while it.valid() {
            got.push((it.pk().to_string(), it.ts()));
            it.next();
        }
        assert_eq!(
            got,
            vec![
                ("a".to_string(), 200),
                ("a".to_string(), 100),
                ("b".to_string(), 300)
            ]
        );
    }

    #[test]
    fn test_traverse_seek_resumes_strictly_older() {
        let table = simple_table();
        table.put("a", 100, b"a1").unwrap();
        table.put("a", 200, b"a2").unwrap();
        table.put("b", 300, b"b1").unwrap();

        let mut it = table.traverse_iterator(0, 0).unwrap();
        it.seek("a", 200);
        assert!(it.valid());
        assert_eq!((it.pk(), it.ts()), ("a", 100));
        it.next();
        assert_eq!((it.pk(), it.ts()), ("b", 300));

        // Resuming past the last entry of "a" moves to "b".
        let mut it = table.traverse_iterator(0, 0).unwrap();
        it.seek("a", 100);
        assert_eq!((it.pk(), it.ts()), ("b", 300));
    }

    #[test]
    fn test_traverse_skips_expired() {
        let table = ttl_table(0, 1, TtlType::LatestTime);
        table.put("a", 100, b"a1").unwrap();
        table.put("a", 200, b"a2").unwrap();
        table.put("b", 300, b"b1").unwrap();

        let mut it = table.traverse_iterator(0, 0).unwrap();
        it.seek_to_first();
        let mut got = Vec::new();
        while it.valid() {
            got.push((it.pk().to_string(), it.ts()));
            it.next();
        }
        // Only the newest entry of each key survives the latest-1 TTL.
        assert_eq!(got, vec![("a".to_string(), 200), ("b".to_string(), 300)]);
    }

    #[test]
    fn test_counters() {
        let table = simple_table();
        table.put("a", 100, b"aa").unwrap();
        table.put("b", 200, b"bb").unwrap();
        assert_eq!(table.record_cnt(), 2);
        assert_eq!(table.record_pk_cnt(), 2);
        assert_eq!(table.record_idx_cnt(), 2);
        assert_eq!(table.record_byte_size(), 4);
    }
}
