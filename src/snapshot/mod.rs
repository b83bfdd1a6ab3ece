//! Point-in-time dumps of a partition.
//!
//! A memory snapshot is one `<name>.sdb` file of framed log entries plus a
//! `MANIFEST` recording the binlog offset it is complete up to. Building a
//! new snapshot is incremental: the previous dump and the binlog span since
//! it are merged, dropping entries that a later delete retired or whose
//! absolute TTL has passed. Writes keep flowing while this runs; the dump is
//! made visible by an atomic `MANIFEST` rewrite.
//!
//! A disk snapshot is a directory holding a copy of the engine's current
//! sorted run; recovery renames it into `data/` and removes `MANIFEST` so
//! the next open treats it as the live tree.

pub mod manifest;

pub use manifest::Manifest;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, WriteBytesExt};

use crate::binlog::entry::{encode_frame, read_frame};
use crate::binlog::{LogEntry, LogPart, OpType};
use crate::clock::now_time_string;
use crate::error::{Error, Result};
use crate::hash::{murmur64, ROOT_HASH_SEED};
use crate::storage::disk_table::DiskTable;
use crate::storage::TsTable;

pub struct Snapshot {
    tid: u32,
    pid: u32,
    dir: PathBuf,
    offset: AtomicU64,
}

impl Snapshot {
    pub fn new(tid: u32, pid: u32, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let offset = Manifest::read(&dir)?.map(|m| m.offset).unwrap_or(0);
        Ok(Self { tid, pid, dir, offset: AtomicU64::new(offset) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Binlog offset the current snapshot is complete up to.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn manifest(&self) -> Result<Option<Manifest>> {
        Manifest::read(&self.dir)
    }

    /// Build a fresh memory-mode dump covering the binlog up to
    /// `end_offset` (or the current tail when zero). Returns the offset the
    /// new snapshot is complete up to.
    pub fn make_snapshot(
        &self,
        table: &TsTable,
        log: &LogPart,
        term: u64,
        end_offset: u64,
    ) -> Result<u64> {
        let old_manifest = self.manifest()?;
        let old_offset = old_manifest.as_ref().map(|m| m.offset).unwrap_or(0);
        let end = if end_offset > 0 { end_offset } else { log.last_offset() };
        if end <= old_offset {
            tracing::info!(
                tid = self.tid,
                pid = self.pid,
                offset = old_offset,
                "snapshot already covers the log"
            );
            return Ok(old_offset);
        }

        // First pass over the delta: delete markers, newest offset wins.
        let mut deleted: HashMap<String, u64> = HashMap::new();
        for entry in log.reader(old_offset + 1)? {
            let entry = entry?;
            if entry.offset > end {
                break;
            }
            if entry.op == OpType::Delete {
                let (key, idx) = delete_target(&entry);
                deleted.insert(format!("{key}|{idx}"), entry.offset);
            }
        }

        let name = format!("{}.sdb", now_time_string());
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file.try_clone()?);
        let mut count = 0u64;

        // Surviving entries of the previous dump.
        if let Some(old) = &old_manifest {
            let old_path = self.dir.join(&old.name);
            let mut reader = BufReader::new(File::open(&old_path)?);
            while let Some(entry) = read_frame(&mut reader)? {
                if let Some(entry) = surviving(table, entry, &deleted) {
                    writer.write_all(&encode_frame(&entry)?)?;
                    count += 1;
                }
            }
        }
        // Surviving puts from the binlog delta.
        for entry in log.reader(old_offset + 1)? {
            let entry = entry?;
            if entry.offset > end {
                break;
            }
            if entry.op != OpType::Put {
                continue;
            }
            if let Some(entry) = surviving(table, entry, &deleted) {
                writer.write_all(&encode_frame(&entry)?)?;
                count += 1;
            }
        }
        writer.flush()?;
        file.sync_all()?;
        fs::rename(&tmp_path, self.dir.join(&name))?;

        let manifest = Manifest { offset: end, term, name: name.clone(), count };
        manifest.write(&self.dir)?;
        if let Some(old) = old_manifest {
            if old.name != name {
                let _ = fs::remove_file(self.dir.join(&old.name));
            }
        }
        self.offset.store(end, Ordering::SeqCst);
        tracing::info!(
            tid = self.tid,
            pid = self.pid,
            offset = end,
            count,
            "made snapshot"
        );
        Ok(end)
    }

    /// Replay the current dump into `table`; returns the offset at which
    /// binlog replay should begin.
    pub fn recover(&self, table: &TsTable) -> Result<u64> {
        let Some(manifest) = self.manifest()? else {
            return Ok(0);
        };
        let path = self.dir.join(&manifest.name);
        let mut reader = BufReader::new(File::open(&path)?);
        let mut applied = 0u64;
        while let Some(entry) = read_frame(&mut reader)? {
            table.apply_entry(&entry)?;
            applied += 1;
        }
        if applied != manifest.count {
            tracing::warn!(
                tid = self.tid,
                pid = self.pid,
                expected = manifest.count,
                applied,
                "snapshot count mismatch"
            );
        }
        self.offset.store(manifest.offset, Ordering::SeqCst);
        tracing::info!(
            tid = self.tid,
            pid = self.pid,
            offset = manifest.offset,
            applied,
            "recovered from snapshot"
        );
        Ok(manifest.offset)
    }

    /// Disk-mode snapshot: flush the engine and copy its current run into a
    /// fresh snapshot directory.
    pub fn make_disk_snapshot(
        &self,
        table: &DiskTable,
        term: u64,
        cur_offset: u64,
    ) -> Result<u64> {
        let old_manifest = self.manifest()?;
        let run_path = table.flush_and_run_path()?;
        let name = now_time_string();
        let snap_dir = self.dir.join(&name);
        fs::create_dir_all(&snap_dir)?;
        let mut count = 0u64;
        if let Some(run_path) = run_path {
            let file_name = run_path
                .file_name()
                .ok_or_else(|| Error::InvalidData("run path has no file name".into()))?;
            fs::copy(&run_path, snap_dir.join(file_name))?;
            count = crate::storage::sst::SstReader::open(snap_dir.join(file_name))?.len() as u64;
        }
        let manifest = Manifest { offset: cur_offset, term, name: name.clone(), count };
        manifest.write(&self.dir)?;
        if let Some(old) = old_manifest {
            if old.name != name {
                let _ = fs::remove_dir_all(self.dir.join(&old.name));
            }
        }
        self.offset.store(cur_offset, Ordering::SeqCst);
        Ok(cur_offset)
    }

    /// Disk-mode recovery: move the snapshot directory into place as the
    /// live data tree and retire the MANIFEST. The snapshot offset stays at
    /// zero afterwards: the dump was consumed, so nothing covers the binlog
    /// until a fresh snapshot is made, and truncation must not advance.
    pub fn recover_disk(&self, data_dir: &Path) -> Result<u64> {
        let Some(manifest) = self.manifest()? else {
            return Ok(0);
        };
        let snap_dir = self.dir.join(&manifest.name);
        fs::rename(&snap_dir, data_dir)?;
        fs::remove_file(self.dir.join("MANIFEST"))?;
        self.offset.store(0, Ordering::SeqCst);
        tracing::info!(
            tid = self.tid,
            pid = self.pid,
            offset = manifest.offset,
            "recovered disk snapshot into data tree"
        );
        Ok(manifest.offset)
    }

    /// Partition the current dump's entries across `whs` by key hash, for
    /// an offline index rebuild. Returns the offset covered and the number
    /// of entries written.
    pub fn dump_index_data(&self, whs: &mut [WriteHandle]) -> Result<(u64, u64)> {
        if whs.is_empty() {
            return errinput!("no index data writers");
        }
        let Some(manifest) = self.manifest()? else {
            return Ok((0, 0));
        };
        let path = self.dir.join(&manifest.name);
        let mut reader = BufReader::new(File::open(&path)?);
        let mut written = 0u64;
        while let Some(entry) = read_frame(&mut reader)? {
            let slot = (murmur64(entry.pk.as_bytes(), ROOT_HASH_SEED) % whs.len() as u64) as usize;
            whs[slot].append(&entry)?;
            written += 1;
        }
        Ok((manifest.offset, written))
    }
}

fn delete_target(entry: &LogEntry) -> (&str, u32) {
    match entry.dimensions.first() {
        Some(dim) if !dim.key.is_empty() => (dim.key.as_str(), dim.idx),
        _ => (entry.pk.as_str(), 0),
    }
}

/// Keep an entry unless it is fully expired or every placement was retired
/// by a later delete. Partially deleted entries get the dead dimensions
/// stripped so recovery does not resurrect them.
fn surviving(
    table: &TsTable,
    mut entry: LogEntry,
    deleted: &HashMap<String, u64>,
) -> Option<LogEntry> {
    if table.core().entry_expired(&entry) {
        return None;
    }
    if entry.dimensions.is_empty() {
        let key = format!("{}|0", entry.pk);
        match deleted.get(&key) {
            Some(del_offset) if *del_offset >= entry.offset => None,
            _ => Some(entry),
        }
    } else {
        let offset = entry.offset;
        entry.dimensions.retain(|dim| {
            match deleted.get(&format!("{}|{}", dim.key, dim.idx)) {
                Some(del_offset) => *del_offset < offset,
                None => true,
            }
        });
        if entry.dimensions.is_empty() {
            return None;
        }
        Some(entry)
    }
}

/// Append side of one index-rebuild output log.
pub struct WriteHandle {
    name: String,
    file: File,
    writer: BufWriter<File>,
    count: u64,
}

/// End-of-log marker: a length no real frame can carry.
const END_MARK: u32 = u32::MAX;

impl WriteHandle {
    pub fn create(name: impl Into<String>, path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self { name: name.into(), file, writer, count: 0 })
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        self.writer.write_all(&encode_frame(entry)?)?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the end marker and make the log durable.
    pub fn end_log(&mut self) -> Result<()> {
        self.writer.write_u32::<BigEndian>(END_MARK)?;
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
