//! In-partition table engines.
//!
//! A time-series partition is backed either by the in-memory skip-list
//! engine (`mem_table`) or the on-disk sorted engine (`disk_table`); the
//! [`TsTable`] enum is the tagged facade the tablet runtime works against.
//! Relational partitions use their own engine (`relational`).

pub mod disk_table;
pub mod iterator;
pub mod keycode;
pub mod mem_table;
pub mod query;
pub mod relational;
pub mod sst;
pub mod ttl;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::binlog::{LogEntry, OpType};
use crate::error::Result;
use crate::meta::{IndexDef, StorageMode, TableMeta, TtlDesc, TtlType};

use disk_table::DiskTable;
use iterator::{TraverseIterator, TsIterator};
use mem_table::MemTable;

/// Payloads are reference counted and shared by every index entry that
/// points at the same record.
pub type ValueRef = Arc<Vec<u8>>;

/// Lifecycle state of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TableStat {
    Normal = 0,
    Loading = 1,
    MakingSnapshot = 2,
    SnapshotPaused = 3,
}

impl TableStat {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TableStat::Loading,
            2 => TableStat::MakingSnapshot,
            3 => TableStat::SnapshotPaused,
            _ => TableStat::Normal,
        }
    }
}

/// State shared by both time-series engines: schema, lifecycle, role, TTL
/// clocks and usage counters.
pub struct TableCore {
    meta: RwLock<TableMeta>,
    stat: AtomicU8,
    leader: AtomicBool,
    ttls: Vec<RwLock<TtlDesc>>,
    expire_enabled: AtomicBool,
    time_offset_ms: AtomicI64,
    diskused: AtomicU64,
    make_snapshot_time: AtomicI64,
}

impl TableCore {
    pub fn new(meta: TableMeta) -> Self {
        let leader = meta.is_leader();
        let ttls = meta.ts_ttls().into_iter().map(RwLock::new).collect();
        Self {
            meta: RwLock::new(meta),
            stat: AtomicU8::new(TableStat::Normal as u8),
            leader: AtomicBool::new(leader),
            ttls,
            expire_enabled: AtomicBool::new(true),
            time_offset_ms: AtomicI64::new(0),
            diskused: AtomicU64::new(0),
            make_snapshot_time: AtomicI64::new(0),
        }
    }

    pub fn meta(&self) -> TableMeta {
        self.meta.read().unwrap().clone()
    }

    pub fn set_meta(&self, meta: TableMeta) {
        *self.meta.write().unwrap() = meta;
    }

    pub fn stat(&self) -> TableStat {
        TableStat::from_u8(self.stat.load(Ordering::SeqCst))
    }

    pub fn set_stat(&self, stat: TableStat) {
        self.stat.store(stat as u8, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn ttl(&self, ts_id: u32) -> TtlDesc {
        let idx = (ts_id as usize).min(self.ttls.len().saturating_sub(1));
        *self.ttls[idx].read().unwrap()
    }

    pub fn set_ttl(&self, ts_id: u32, abs_ttl: u64, lat_ttl: u64) {
        let idx = (ts_id as usize).min(self.ttls.len().saturating_sub(1));
        let mut ttl = self.ttls[idx].write().unwrap();
        ttl.abs_ttl = abs_ttl;
        ttl.lat_ttl = lat_ttl;
    }

    pub fn set_all_ttl(&self, abs_ttl: u64, lat_ttl: u64) {
        for slot in &self.ttls {
            let mut ttl = slot.write().unwrap();
            ttl.abs_ttl = abs_ttl;
            ttl.lat_ttl = lat_ttl;
        }
    }

    pub fn expire_enabled(&self) -> bool {
        self.expire_enabled.load(Ordering::SeqCst)
    }

    pub fn set_expire(&self, enabled: bool) {
        self.expire_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms.load(Ordering::SeqCst)
    }

    pub fn set_time_offset_ms(&self, offset: i64) {
        self.time_offset_ms.store(offset, Ordering::SeqCst);
    }

    /// Wall clock in milliseconds, shifted by the virtual TTL clock.
    pub fn current_time_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        (now + self.time_offset_ms()) as u64
    }

    /// Absolute cutoff below which entries are expired; zero disables it.
    pub fn expire_time(&self, abs_ttl_min: u64) -> u64 {
        if abs_ttl_min == 0 || !self.expire_enabled() {
            return 0;
        }
        self.current_time_ms().saturating_sub(abs_ttl_min * 60 * 1000)
    }

    pub fn diskused(&self) -> u64 {
        self.diskused.load(Ordering::SeqCst)
    }

    pub fn set_diskused(&self, bytes: u64) {
        self.diskused.store(bytes, Ordering::SeqCst);
    }

    pub fn make_snapshot_time(&self) -> i64 {
        self.make_snapshot_time.load(Ordering::SeqCst)
    }

    pub fn set_make_snapshot_time(&self, secs: i64) {
        self.make_snapshot_time.store(secs, Ordering::SeqCst);
    }

    /// Whether a log entry is wholly past its absolute TTL at every
    /// placement. Count-based limits cannot be judged from the entry alone
    /// and are left to GC after load.
    pub fn entry_expired(&self, entry: &LogEntry) -> bool {
        if entry.op == OpType::Delete {
            return false;
        }
        let dim_expired = |ts_id: u32, ts: u64| {
            let ttl = self.ttl(ts_id);
            if !matches!(ttl.ttl_type, TtlType::AbsoluteTime | TtlType::AbsOrLat) {
                return false;
            }
            let expire_time = self.expire_time(ttl.abs_ttl);
            expire_time != 0 && ts <= expire_time
        };
        if entry.ts_dimensions.is_empty() {
            dim_expired(0, entry.ts)
        } else {
            entry.ts_dimensions.iter().all(|d| dim_expired(d.idx, d.ts))
        }
    }
}

/// Tagged facade over the two time-series engines.
pub enum TsTable {
    Mem(MemTable),
    Disk(DiskTable),
}

impl TsTable {
    pub fn core(&self) -> &TableCore {
        match self {
            TsTable::Mem(t) => t.core(),
            TsTable::Disk(t) => t.core(),
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        match self {
            TsTable::Mem(_) => StorageMode::Memory,
            TsTable::Disk(t) => t.storage_mode(),
        }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, TsTable::Mem(_))
    }

    pub fn disk(&self) -> Option<&DiskTable> {
        match self {
            TsTable::Mem(_) => None,
            TsTable::Disk(t) => Some(t),
        }
    }

    pub fn put(&self, pk: &str, ts: u64, value: &[u8]) -> Result<()> {
        match self {
            TsTable::Mem(t) => t.put(pk, ts, value),
            TsTable::Disk(t) => t.put(pk, ts, value),
        }
    }

    /// Apply a log entry: leader write path, follower replication and
    /// recovery all funnel through here so they stay byte-equivalent.
    pub fn apply_entry(&self, entry: &LogEntry) -> Result<()> {
        match self {
            TsTable::Mem(t) => t.apply_entry(entry),
            TsTable::Disk(t) => t.apply_entry(entry),
        }
    }

    pub fn delete(&self, pk: &str, idx: u32) -> Result<bool> {
        match self {
            TsTable::Mem(t) => t.delete(pk, idx),
            TsTable::Disk(t) => t.delete(pk, idx),
        }
    }

    pub fn ts_iterator(
        &self,
        idx: u32,
        slot: usize,
        pk: &str,
    ) -> Result<Box<dyn TsIterator + Send>> {
        match self {
            TsTable::Mem(t) => t.ts_iterator(idx, slot, pk),
            TsTable::Disk(t) => t.ts_iterator(idx, slot, pk),
        }
    }

    pub fn traverse_iterator(
        &self,
        idx: u32,
        slot: usize,
    ) -> Result<Box<dyn TraverseIterator + Send>> {
        match self {
            TsTable::Mem(t) => t.traverse_iterator(idx, slot),
            TsTable::Disk(t) => t.traverse_iterator(idx, slot),
        }
    }

    /// Run one GC pass, returning how many entries were evicted.
    pub fn sched_gc(&self) -> Result<u64> {
        match self {
            TsTable::Mem(t) => t.sched_gc(),
            TsTable::Disk(t) => t.sched_gc(),
        }
    }

    pub fn record_cnt(&self) -> u64 {
        match self {
            TsTable::Mem(t) => t.record_cnt(),
            TsTable::Disk(t) => t.record_cnt(),
        }
    }

    pub fn record_byte_size(&self) -> u64 {
        match self {
            TsTable::Mem(t) => t.record_byte_size(),
            TsTable::Disk(_) => 0,
        }
    }

    pub fn record_pk_cnt(&self) -> u64 {
        match self {
            TsTable::Mem(t) => t.record_pk_cnt(),
            TsTable::Disk(_) => 0,
        }
    }

    pub fn record_idx_cnt(&self) -> u64 {
        match self {
            TsTable::Mem(t) => t.record_idx_cnt(),
            TsTable::Disk(_) => 0,
        }
    }

    /// Resolve an index by name; `None` input means the default (first)
    /// index. Returns `None` for unknown or inactive indexes.
    pub fn resolve_index(&self, name: Option<&str>) -> Option<IndexDef> {
        let defs = self.core().meta().index_defs();
        let def = match name {
            None => defs.first().cloned(),
            Some(name) => defs.iter().find(|d| d.name == name).cloned(),
        }?;
        let ready = match self {
            TsTable::Mem(t) => t.index_ready(def.id),
            TsTable::Disk(_) => true,
        };
        ready.then_some(def)
    }

    /// Resolve a ts column name to the slot inside `def`. `Ok(0)` when no
    /// name was given. `Err(())` when the name is unknown to the table or
    /// not wired into this index.
    pub fn resolve_ts_slot(
        &self,
        def: &IndexDef,
        ts_name: Option<&str>,
    ) -> std::result::Result<usize, ()> {
        match ts_name {
            None => Ok(0),
            Some(name) => {
                let mapping = self.core().meta().ts_mapping();
                let ts_id = *mapping.get(name).ok_or(())?;
                if def.ts_cols.is_empty() {
                    return if ts_id == 0 { Ok(0) } else { Err(()) };
                }
                def.ts_cols.iter().position(|id| *id == ts_id).ok_or(())
            }
        }
    }

    /// Effective TTL for one `(index, slot)` pair.
    pub fn effective_ttl(&self, def: &IndexDef, slot: usize) -> TtlDesc {
        let ts_id = def.ts_cols.get(slot).copied().unwrap_or(0);
        self.core().ttl(ts_id)
    }

    /// Mark an index inactive (memory engine only); its entries are
    /// reclaimed by the next GC pass.
    pub fn delete_index(&self, name: &str) -> Result<bool> {
        match self {
            TsTable::Mem(t) => t.delete_index(name),
            TsTable::Disk(_) => Ok(false),
        }
    }
}
