use std::path::PathBuf;
use std::time::Duration;

use crate::meta::StorageMode;

/// Configuration for a tablet node. Passed explicitly at construction; there
/// is no process-wide flag bag.
#[derive(Debug, Clone)]
pub struct TabletConfig {
    /// Roots for memory-mode partition directories.
    pub db_root_paths: Vec<PathBuf>,

    /// Roots for SSD-mode partition directories.
    pub ssd_root_paths: Vec<PathBuf>,

    /// Roots for HDD-mode partition directories.
    pub hdd_root_paths: Vec<PathBuf>,

    /// Recycle-bin roots, one set per storage mode.
    pub recycle_bin_root_paths: Vec<PathBuf>,
    pub recycle_ssd_bin_root_paths: Vec<PathBuf>,
    pub recycle_hdd_bin_root_paths: Vec<PathBuf>,

    /// Whether dropped partitions are moved to the recycle bin (default: true).
    pub recycle_bin_enabled: bool,

    /// Minutes a recycled directory is retained before the sweep reclaims it.
    pub recycle_ttl: u64,

    /// Minutes between GC passes on memory tables.
    pub gc_interval: u64,

    /// Minutes between GC passes on disk tables.
    pub disk_gc_interval: u64,

    /// Worker count for the GC pool.
    pub gc_pool_size: usize,

    /// Scan aborts once accumulated payload bytes exceed this bound.
    pub scan_max_bytes_size: u64,

    /// Initial capacity reserved for scan result buffers.
    pub scan_reserve_size: usize,

    /// Traverse gives up after stepping this many entries.
    pub max_traverse_cnt: u64,

    /// Deployment ceiling for absolute TTLs (minutes).
    pub absolute_ttl_max: u64,

    /// Deployment ceiling for latest-N TTLs.
    pub latest_ttl_max: u64,

    /// Hour of day (0-23) in which the nightly snapshot window opens.
    pub make_snapshot_time: u32,

    /// How often to check whether the snapshot window is open.
    pub make_snapshot_check_interval: Duration,

    /// Seconds a memory table may skip the window after a recent snapshot.
    pub make_snapshot_offline_interval: u64,

    /// Minimum offset delta between snapshots; below it the tick is a no-op.
    pub make_snapshot_threshold_offset: u64,

    /// Minutes between periodic disk-table snapshots.
    pub make_disktable_snapshot_interval: u64,

    /// How often binlog segments are fsynced.
    pub binlog_sync_to_disk_interval: Duration,

    /// How often retired binlog segments are deleted.
    pub binlog_delete_interval: Duration,

    /// Wake follower syncers on every leader put instead of on the next poll.
    pub binlog_notify_on_put: bool,

    /// Byte size at which the active binlog segment is rolled.
    pub binlog_single_file_max_size: u64,

    /// Chunk size for snapshot file shipping.
    pub stream_block_size: usize,

    /// Worker count for the long-running-op pool.
    pub task_pool_size: usize,

    /// Worker count for the binlog fsync pool.
    pub io_pool_size: usize,

    /// How often per-table disk usage is sampled.
    pub get_table_diskused_interval: Duration,

    /// Allocator release tuning, surfaced by ShowMemPool.
    pub mem_release_rate: u32,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            db_root_paths: vec![PathBuf::from("./tabletdb/db")],
            ssd_root_paths: Vec::new(),
            hdd_root_paths: Vec::new(),
            recycle_bin_root_paths: vec![PathBuf::from("./tabletdb/recycle")],
            recycle_ssd_bin_root_paths: Vec::new(),
            recycle_hdd_bin_root_paths: Vec::new(),
            recycle_bin_enabled: true,
            recycle_ttl: 24 * 60,
            gc_interval: 120,
            disk_gc_interval: 24 * 60,
            gc_pool_size: 2,
            scan_max_bytes_size: 32 * 1024 * 1024,
            scan_reserve_size: 50,
            max_traverse_cnt: 50_000,
            absolute_ttl_max: 60 * 24 * 365 * 30,
            latest_ttl_max: 1000,
            make_snapshot_time: 2,
            make_snapshot_check_interval: Duration::from_secs(10 * 60),
            make_snapshot_offline_interval: 60 * 60,
            make_snapshot_threshold_offset: 50_000,
            make_disktable_snapshot_interval: 24 * 60,
            binlog_sync_to_disk_interval: Duration::from_millis(5000),
            binlog_delete_interval: Duration::from_secs(60),
            binlog_notify_on_put: false,
            binlog_single_file_max_size: 128 * 1024 * 1024,
            stream_block_size: 1024 * 1024,
            task_pool_size: 2,
            io_pool_size: 2,
            get_table_diskused_interval: Duration::from_secs(10 * 60),
            mem_release_rate: 5,
        }
    }
}

impl TabletConfig {
    /// Create a new config rooted at the given directory for every path kind.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_root_paths: vec![root.join("db")],
            ssd_root_paths: vec![root.join("ssd")],
            hdd_root_paths: vec![root.join("hdd")],
            recycle_bin_root_paths: vec![root.join("recycle")],
            recycle_ssd_bin_root_paths: vec![root.join("recycle_ssd")],
            recycle_hdd_bin_root_paths: vec![root.join("recycle_hdd")],
            ..Default::default()
        }
    }

    /// Parse a comma-separated root list the way deployments configure it.
    pub fn parse_roots(list: &str) -> Vec<PathBuf> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Roots for the given storage mode.
    pub fn roots(&self, mode: StorageMode) -> &[PathBuf] {
        match mode {
            StorageMode::Memory => &self.db_root_paths,
            StorageMode::Ssd => &self.ssd_root_paths,
            StorageMode::Hdd => &self.hdd_root_paths,
        }
    }

    /// Recycle-bin roots for the given storage mode.
    pub fn recycle_roots(&self, mode: StorageMode) -> &[PathBuf] {
        match mode {
            StorageMode::Memory => &self.recycle_bin_root_paths,
            StorageMode::Ssd => &self.recycle_ssd_bin_root_paths,
            StorageMode::Hdd => &self.recycle_hdd_bin_root_paths,
        }
    }

    pub fn recycle_bin_enabled(mut self, enabled: bool) -> Self {
        self.recycle_bin_enabled = enabled;
        self
    }

    pub fn gc_interval(mut self, minutes: u64) -> Self {
        self.gc_interval = minutes;
        self
    }

    pub fn scan_max_bytes_size(mut self, bytes: u64) -> Self {
        self.scan_max_bytes_size = bytes;
        self
    }

    pub fn max_traverse_cnt(mut self, cnt: u64) -> Self {
        self.max_traverse_cnt = cnt;
        self
    }

    pub fn ttl_max(mut self, absolute: u64, latest: u64) -> Self {
        self.absolute_ttl_max = absolute;
        self.latest_ttl_max = latest;
        self
    }

    pub fn make_snapshot_threshold_offset(mut self, offset: u64) -> Self {
        self.make_snapshot_threshold_offset = offset;
        self
    }

    pub fn binlog_single_file_max_size(mut self, bytes: u64) -> Self {
        self.binlog_single_file_max_size = bytes;
        self
    }

    pub fn binlog_notify_on_put(mut self, enabled: bool) -> Self {
        self.binlog_notify_on_put = enabled;
        self
    }

    pub fn stream_block_size(mut self, bytes: usize) -> Self {
        self.stream_block_size = bytes;
        self
    }
}
