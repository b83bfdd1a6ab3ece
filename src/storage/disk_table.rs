//! On-disk time-series engine.
//!
//! Entries live under the composite key `(index_id, user_key, ts_column_id,
//! !ts)` (see `keycode`). Writes land in an in-memory active layer; a flush
//! freezes it and merges frozen + previous run into a single new sorted-run
//! file under `data/`, applying pending key tombstones and, on GC flushes,
//! the TTL filter. The binlog is the durability story for the active layer:
//! replay from the snapshot offset reconstructs whatever had not been
//! flushed.
//!
//! Only `AbsoluteTime` and `LatestTime` TTLs are supported here; the
//! conjunction/disjunction flavors are rejected at creation.

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::binlog::{LogEntry, OpType};
use crate::error::{Error, Result};
use crate::meta::{IndexDef, StorageMode, TableMeta, TtlDesc, TtlType};
use crate::storage::iterator::{TraverseIterator, TsIterator};
use crate::storage::keycode::{
    decode_combined, encode_combined, encode_key_prefix, encode_ts_prefix,
};
use crate::storage::sst::{parse_run_id, run_file_name, SstReader, SstWriter};
use crate::storage::ttl::is_expired;
use crate::storage::{TableCore, ValueRef};

type MemLayer = Arc<SkipMap<Vec<u8>, ValueRef>>;

struct Layers {
    active: MemLayer,
    /// Newest first. Normally at most one entry; a failed flush leaves its
    /// layer here so the next flush retries it.
    frozen: Vec<MemLayer>,
    run: Option<Arc<SstReader>>,
}

pub struct DiskTable {
    core: TableCore,
    storage_mode: StorageMode,
    data_dir: PathBuf,
    defs: Vec<IndexDef>,
    layers: RwLock<Layers>,
    masks: RwLock<Vec<Vec<u8>>>,
    next_run_id: AtomicU64,
    record_cnt: AtomicU64,
    flush_mu: Mutex<()>,
}

impl DiskTable {
    pub fn open(meta: TableMeta, data_dir: impl Into<PathBuf>) -> Result<Self> {
        if matches!(meta.ttl_type(), TtlType::AbsAndLat | TtlType::AbsOrLat) {
            return errinput!("disk table only supports absolute or latest ttl");
        }
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let mut ids: Vec<u64> = fs::read_dir(&data_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "sst"))
            .map(|p| parse_run_id(&p))
            .collect::<Result<Vec<_>>>()?;
        ids.sort_unstable();

        // Newest complete run wins; stale or torn leftovers are removed.
        let mut run = None;
        while let Some(id) = ids.pop() {
            let path = data_dir.join(run_file_name(id));
            match SstReader::open(&path) {
                Ok(reader) => {
                    run = Some((id, Arc::new(reader)));
                    break;
                }
                Err(Error::Corrupted(msg)) => {
                    tracing::warn!(run = id, error = %msg, "dropping torn run file");
                    let _ = fs::remove_file(&path);
                }
                Err(e) => return Err(e),
            }
        }
        for id in ids {
            let _ = fs::remove_file(data_dir.join(run_file_name(id)));
        }

        let next_run_id = run.as_ref().map(|(id, _)| id + 1).unwrap_or(0);
        let storage_mode = meta.storage_mode;
        let defs = meta.index_defs();
        Ok(Self {
            core: TableCore::new(meta),
            storage_mode,
            data_dir,
            defs,
            layers: RwLock::new(Layers {
                active: Arc::new(SkipMap::new()),
                frozen: Vec::new(),
                run: run.map(|(_, r)| r),
            }),
            masks: RwLock::new(Vec::new()),
            next_run_id: AtomicU64::new(next_run_id),
            record_cnt: AtomicU64::new(0),
            flush_mu: Mutex::new(()),
        })
    }

    pub fn core(&self) -> &TableCore {
        &self.core
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ts_ids(&self, idx: u32) -> Vec<u32> {
        let def = &self.defs[idx as usize];
        if def.ts_cols.is_empty() {
            vec![0]
        } else {
            def.ts_cols.clone()
        }
    }

    fn ts_id_for_slot(&self, idx: u32, slot: usize) -> Result<u32> {
        let ids = self.ts_ids(idx);
        ids.get(slot)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("invalid ts slot {slot} for index {idx}")))
    }

    fn check_idx(&self, idx: u32) -> Result<()> {
        if idx as usize >= self.defs.len() {
            return errinput!("invalid index id {idx}");
        }
        Ok(())
    }

    pub fn put(&self, pk: &str, ts: u64, value: &[u8]) -> Result<()> {
        let value: ValueRef = Arc::new(value.to_vec());
        self.insert(0, pk, &self.ts_ids(0), ts, &value);
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn put_dims(&self, dims: &[(String, u32)], ts: u64, value: &[u8]) -> Result<()> {
        self.check_dims(dims)?;
        let value: ValueRef = Arc::new(value.to_vec());
        for (key, idx) in dims {
            self.insert(*idx, key, &self.ts_ids(*idx), ts, &value);
        }
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

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
            let wired = self.ts_ids(*idx);
            for (ts, ts_id) in ts_dims {
                if wired.contains(ts_id) {
                    self.insert(*idx, key, &[*ts_id], *ts, &value);
                }
            }
        }
        self.record_cnt.fetch_add(1, Ordering::SeqCst);
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
            self.check_idx(*idx)?;
        }
        Ok(())
    }

    fn insert(&self, idx: u32, pk: &str, ts_ids: &[u32], ts: u64, value: &ValueRef) {
        let layers = self.layers.read().unwrap();
        for ts_id in ts_ids {
            let key = encode_combined(idx, pk.as_bytes(), *ts_id, ts);
            layers.active.insert(key, value.clone());
        }
    }

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

    /// Drop every entry of `pk` under one index. The active layer is purged
    /// eagerly; older layers are masked until the next flush merges the
    /// tombstone away.
    pub fn delete(&self, pk: &str, idx: u32) -> Result<bool> {
        self.check_idx(idx)?;
        let prefix = encode_key_prefix(idx, pk.as_bytes());
        let mut existed = false;
        {
            let layers = self.layers.read().unwrap();
            let doomed: Vec<Vec<u8>> = layers
                .active
                .range((Bound::Included(prefix.clone()), Bound::Unbounded))
                .take_while(|e| e.key().starts_with(&prefix))
                .map(|e| e.key().clone())
                .collect();
            for key in doomed {
                if layers.active.remove(&key).is_some() {
                    existed = true;
                }
            }
            for frozen in &layers.frozen {
                if frozen
                    .range((Bound::Included(prefix.clone()), Bound::Unbounded))
                    .next()
                    .map_or(false, |e| e.key().starts_with(&prefix))
                {
                    existed = true;
                }
            }
            if let Some(run) = &layers.run {
                if run.next_key(&prefix, false).map_or(false, |k| k.starts_with(&prefix)) {
                    existed = true;
                }
            }
        }
        self.masks.write().unwrap().push(prefix);
        Ok(existed)
    }

    fn view(&self) -> View {
        let layers = self.layers.read().unwrap();
        let mut mems = vec![layers.active.clone()];
        mems.extend(layers.frozen.iter().cloned());
        View {
            mems,
            run: layers.run.clone(),
            masks: self.masks.read().unwrap().clone(),
        }
    }

    pub fn ts_iterator(
        &self,
        idx: u32,
        slot: usize,
        pk: &str,
    ) -> Result<Box<dyn TsIterator + Send>> {
        self.check_idx(idx)?;
        let ts_id = self.ts_id_for_slot(idx, slot)?;
        Ok(Box::new(DiskTsIterator {
            view: self.view(),
            prefix: encode_ts_prefix(idx, pk.as_bytes(), ts_id),
            idx,
            pk: pk.as_bytes().to_vec(),
            ts_id,
            cur: None,
        }))
    }

    pub fn traverse_iterator(
        &self,
        idx: u32,
        slot: usize,
    ) -> Result<Box<dyn TraverseIterator + Send>> {
        self.check_idx(idx)?;
        let ts_id = self.ts_id_for_slot(idx, slot)?;
        let ttl = self.core.ttl(ts_id);
        Ok(Box::new(DiskTraverseIterator {
            view: self.view(),
            index_prefix: crate::storage::keycode::encode_index_prefix(idx),
            idx,
            ts_id,
            ttl,
            expire_time: self.core.expire_time(ttl.abs_ttl),
            expire_enabled: self.core.expire_enabled(),
            cur: None,
            cur_pk: String::new(),
            per_key_steps: 0,
            steps: 0,
        }))
    }

    /// GC pass: a flush with the TTL filter enabled.
    pub fn sched_gc(&self) -> Result<u64> {
        if !self.core.expire_enabled() {
            return Ok(0);
        }
        self.flush(true)
    }

    /// Merge frozen + run into a single new run. With `filter`, entries past
    /// their TTL are dropped; key tombstones are always merged away.
    /// Returns the number of entries dropped by the TTL filter.
    pub fn flush(&self, filter: bool) -> Result<u64> {
        let _guard = self.flush_mu.lock()?;

        // Freeze the active layer; writers continue against a fresh one. Any
        // layer left behind by an earlier failed flush is merged along.
        let (frozen, old_run) = {
            let mut layers = self.layers.write().unwrap();
            let old_active = std::mem::replace(&mut layers.active, Arc::new(SkipMap::new()));
            layers.frozen.insert(0, old_active);
            (layers.frozen.clone(), layers.run.clone())
        };
        let masks_at_start: Vec<Vec<u8>> = self.masks.read().unwrap().clone();

        let merge = View {
            mems: frozen.clone(),
            run: old_run.clone(),
            masks: masks_at_start.clone(),
        };

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let path = self.data_dir.join(run_file_name(run_id));
        let mut writer = SstWriter::create(&path)?;
        let mut evicted = 0u64;
        let mut group: Option<Vec<u8>> = None;
        let mut group_steps = 0u64;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let next = match &cursor {
                Some(key) => merge.next_key(key, true),
                None => merge.next_key(&[], false),
            };
            let Some((key, value)) = next else { break };
            cursor = Some(key.clone());
            if filter {
                let (_, _, ts_col, ts) = decode_combined(&key)?;
                let group_prefix = &key[..key.len() - 8];
                if group.as_deref() != Some(group_prefix) {
                    group = Some(group_prefix.to_vec());
                    group_steps = 0;
                }
                let ttl = self.core.ttl(ts_col);
                let expire_time = self.core.expire_time(ttl.abs_ttl);
                if is_expired(ttl.ttl_type, ts, group_steps, expire_time, ttl.lat_ttl) {
                    evicted += 1;
                    group_steps += 1;
                    continue;
                }
                group_steps += 1;
            }
            writer.add(&key, &value)?;
        }
        writer.finish()?;
        let new_run = Arc::new(SstReader::open(&path)?);

        {
            let mut layers = self.layers.write().unwrap();
            layers
                .frozen
                .retain(|layer| !frozen.iter().any(|f| Arc::ptr_eq(f, layer)));
            layers.run = Some(new_run);
        }
        self.masks
            .write()
            .unwrap()
            .retain(|m| !masks_at_start.contains(m));
        if let Some(old) = old_run {
            if let Err(e) = fs::remove_file(old.path()) {
                tracing::warn!(path = ?old.path(), error = %e, "failed to remove old run");
            }
        }
        tracing::debug!(run = run_id, evicted, "disk table flushed");
        Ok(evicted)
    }

    /// Path of the current run, flushing first so it covers every write.
    pub fn flush_and_run_path(&self) -> Result<Option<PathBuf>> {
        self.flush(false)?;
        let layers = self.layers.read().unwrap();
        Ok(layers.run.as_ref().map(|r| r.path().to_path_buf()))
    }

    pub fn record_cnt(&self) -> u64 {
        self.record_cnt.load(Ordering::SeqCst)
    }
}

/// Consistent multi-layer read view. `mems` are ordered newest first and
/// win over the run on equal keys; masked prefixes hide frozen/run entries
/// that a delete has already retired.
struct View {
    mems: Vec<MemLayer>,
    run: Option<Arc<SstReader>>,
    masks: Vec<Vec<u8>>,
}

impl View {
    fn masked(&self, key: &[u8]) -> bool {
        self.masks.iter().any(|m| key.starts_with(m))
    }

    /// Smallest key at or after `from` (exclusive when `excl`) across all
    /// layers, with its value resolved by layer priority.
    fn next_key(&self, from: &[u8], excl: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut best: Option<(Vec<u8>, Vec<u8>)> = None;
        for (layer_no, mem) in self.mems.iter().enumerate() {
            let lower = if excl {
                Bound::Excluded(from.to_vec())
            } else {
                Bound::Included(from.to_vec())
            };
            let mut range = mem.range((lower, Bound::Unbounded));
            loop {
                let Some(entry) = range.next() else { break };
                // Masks only apply below the active layer.
                if layer_no > 0 && self.masked(entry.key()) {
                    continue;
                }
                match &best {
                    Some((bk, _)) if bk <= entry.key() => {}
                    _ => best = Some((entry.key().clone(), entry.value().to_vec())),
                }
                break;
            }
        }
        if let Some(run) = &self.run {
            let mut probe = from.to_vec();
            let mut probe_excl = excl;
            loop {
                let Some(key) = run.next_key(&probe, probe_excl) else { break };
                if self.masked(key) {
                    probe = key.to_vec();
                    probe_excl = true;
                    continue;
                }
                let better = match &best {
                    Some((bk, _)) => key < bk.as_slice(),
                    None => true,
                };
                if better {
                    let value = run.get(key).ok().flatten().unwrap_or_default();
                    best = Some((key.to_vec(), value));
                }
                break;
            }
        }
        best
    }
}

struct DiskTsIterator {
    view: View,
    prefix: Vec<u8>,
    idx: u32,
    pk: Vec<u8>,
    ts_id: u32,
    cur: Option<(Vec<u8>, Vec<u8>, u64)>,
}

impl DiskTsIterator {
    fn position(&mut self, from: &[u8], excl: bool) {
        self.cur = self
            .view
            .next_key(from, excl)
            .filter(|(key, _)| key.starts_with(&self.prefix))
            .and_then(|(key, value)| {
                let (_, _, _, ts) = decode_combined(&key).ok()?;
                Some((key, value, ts))
            });
    }
}

impl TsIterator for DiskTsIterator {
    fn seek_to_first(&mut self) {
        let prefix = self.prefix.clone();
        self.position(&prefix, false);
    }

    fn seek(&mut self, ts: u64) {
        let target = encode_combined(self.idx, &self.pk, self.ts_id, ts);
        self.position(&target, false);
    }

    fn next(&mut self) {
        let Some((key, _, _)) = self.cur.clone() else { return };
        self.position(&key, true);
    }

    fn valid(&self) -> bool {
        self.cur.is_some()
    }

    fn ts(&self) -> u64 {
        self.cur.as_ref().map(|(_, _, ts)| *ts).unwrap_or(0)
    }

    fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v, _)| v.as_slice()).unwrap_or(&[])
    }
}

struct DiskTraverseIterator {
    view: View,
    index_prefix: Vec<u8>,
    idx: u32,
    ts_id: u32,
    ttl: TtlDesc,
    expire_time: u64,
    expire_enabled: bool,
    cur: Option<(Vec<u8>, Vec<u8>, u64)>,
    cur_pk: String,
    per_key_steps: u64,
    steps: u64,
}

impl DiskTraverseIterator {
    fn entry_expired(&self, ts: u64, steps: u64) -> bool {
        self.expire_enabled
            && is_expired(self.ttl.ttl_type, ts, steps, self.expire_time, self.ttl.lat_ttl)
    }

    /// Walk to the next live entry of this index's chosen ts column.
    fn walk(&mut self, from: &[u8], excl: bool) {
        let mut probe = from.to_vec();
        let mut probe_excl = excl;
        loop {
            let Some((key, value)) = self.view.next_key(&probe, probe_excl) else {
                self.cur = None;
                return;
            };
            if !key.starts_with(&self.index_prefix) {
                self.cur = None;
                return;
            }
            let Ok((_, pk, ts_col, ts)) = decode_combined(&key) else {
                self.cur = None;
                return;
            };
            probe = key.clone();
            probe_excl = true;
            if ts_col != self.ts_id {
                continue;
            }
            let pk = String::from_utf8_lossy(&pk).into_owned();
            if pk != self.cur_pk {
                self.cur_pk = pk;
                self.per_key_steps = 0;
            }
            self.steps += 1;
            if self.entry_expired(ts, self.per_key_steps) {
                self.per_key_steps += 1;
                continue;
            }
            self.per_key_steps += 1;
            self.cur = Some((key, value, ts));
            return;
        }
    }
}

impl TraverseIterator for DiskTraverseIterator {
    fn seek_to_first(&mut self) {
        self.cur_pk.clear();
        self.per_key_steps = 0;
        let prefix = self.index_prefix.clone();
        self.walk(&prefix, false);
    }

    fn seek(&mut self, pk: &str, ts: u64) {
        // Count entries at or newer than ts so TTL step accounting holds.
        let group = encode_ts_prefix(self.idx, pk.as_bytes(), self.ts_id);
        let target = encode_combined(self.idx, pk.as_bytes(), self.ts_id, ts);
        let mut newer = 0u64;
        let mut probe = group.clone();
        let mut probe_excl = false;
        while let Some((key, _)) = self.view.next_key(&probe, probe_excl) {
            if !key.starts_with(&group) || key > target {
                break;
            }
            newer += 1;
            probe = key;
            probe_excl = true;
        }
        self.cur_pk = pk.to_string();
        self.per_key_steps = newer;
        self.walk(&target, true);
    }

    fn next(&mut self) {
        let Some((key, _, _)) = self.cur.clone() else { return };
        self.walk(&key, true);
    }

    fn valid(&self) -> bool {
        self.cur.is_some()
    }

    fn pk(&self) -> &str {
        &self.cur_pk
    }

    fn ts(&self) -> u64 {
        self.cur.as_ref().map(|(_, _, ts)| *ts).unwrap_or(0)
    }

    fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v, _)| v.as_slice()).unwrap_or(&[])
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{TableMeta, TtlDesc, TtlType};

    fn open_table(dir: &Path) -> DiskTable {
        let meta = TableMeta::new("d1", 1, 0).storage(StorageMode::Ssd);
        DiskTable::open(meta, dir.join("data")).expect("open failed")
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
    fn test_rejects_composite_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = TableMeta::new("d1", 1, 0)
            .storage(StorageMode::Ssd)
            .ttl(TtlDesc::new(10, 3, TtlType::AbsOrLat));
        assert!(DiskTable::open(meta, dir.path().join("data")).is_err());
    }

    #[test]
    fn test_put_and_iterate_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        table.put("k", 100, b"v1").unwrap();
        table.put("k", 300, b"v3").unwrap();
        table.put("k", 200, b"v2").unwrap();

        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        assert_eq!(
            collect(it.as_mut()),
            vec![(300, b"v3".to_vec()), (200, b"v2".to_vec()), (100, b"v1".to_vec())]
        );
    }

    #[test]
    fn test_read_spans_flushed_and_fresh_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        table.put("k", 100, b"old").unwrap();
        table.flush(false).unwrap();
        table.put("k", 200, b"new").unwrap();

        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        assert_eq!(
            collect(it.as_mut()),
            vec![(200, b"new".to_vec()), (100, b"old".to_vec())]
        );
    }

    #[test]
    fn test_reopen_reads_flushed_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let table = open_table(dir.path());
            table.put("k", 100, b"v").unwrap();
            table.flush(false).unwrap();
        }
        let table = open_table(dir.path());
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(100, b"v".to_vec())]);
    }

    #[test]
    fn test_delete_masks_flushed_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        table.put("k", 100, b"v").unwrap();
        table.flush(false).unwrap();

        assert!(table.delete("k", 0).unwrap());
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        it.seek_to_first();
        assert!(!it.valid());

        // A put after the delete is visible again.
        table.put("k", 200, b"v2").unwrap();
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(200, b"v2".to_vec())]);

        // The tombstone survives the merge.
        table.flush(false).unwrap();
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        assert_eq!(collect(it.as_mut()), vec![(200, b"v2".to_vec())]);
    }

    #[test]
    fn test_gc_latest_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = TableMeta::new("d1", 1, 0)
            .storage(StorageMode::Ssd)
            .ttl(TtlDesc::new(0, 2, TtlType::LatestTime));
        let table = DiskTable::open(meta, dir.path().join("data")).expect("open failed");
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
    fn test_gc_absolute_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = TableMeta::new("d1", 1, 0)
            .storage(StorageMode::Ssd)
            .ttl(TtlDesc::new(1, 0, TtlType::AbsoluteTime));
        let table = DiskTable::open(meta, dir.path().join("data")).expect("open failed");
        let now = table.core().current_time_ms();
        table.put("k", now.saturating_sub(10 * 60 * 1000), b"old").unwrap();
        table.put("k", now, b"new").unwrap();
        assert_eq!(table.sched_gc().unwrap(), 1);
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        let got = collect(it.as_mut());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"new".to_vec());
    }

    #[test]
    fn test_seek() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        for ts in [100u64, 200, 300] {
            table.put("k", ts, b"v").unwrap();
        }
        let mut it = table.ts_iterator(0, 0, "k").unwrap();
        it.seek(250);
        assert!(it.valid());
        assert_eq!(it.ts(), 200);
        it.seek(99);
        assert!(!it.valid());
    }

    #[test]
    fn test_traverse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        table.put("a", 100, b"a1").unwrap();
        table.put("a", 200, b"a2").unwrap();
        table.flush(false).unwrap();
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
    fn test_traverse_seek_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = open_table(dir.path());
        table.put("a", 100, b"a1").unwrap();
        table.put("a", 200, b"a2").unwrap();
        table.put("b", 300, b"b1").unwrap();

        let mut it = table.traverse_iterator(0, 0).unwrap();
        it.seek("a", 200);
        assert!(it.valid());
        assert_eq!((it.pk(), it.ts()), ("a", 100));
        it.next();
        assert_eq!((it.pk(), it.ts()), ("b", 300));
    }
}
