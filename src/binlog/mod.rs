//! Append-only sharded binlog.
//!
//! A partition's binlog is a sequence of fixed-size segment files under
//! `binlog/`, each holding framed [`LogEntry`] records with dense,
//! monotonically increasing offsets. Appends go to the active segment and
//! roll to a new file once the size cap is reached; closed segments are
//! immutable and may be deleted once a snapshot and every follower have
//! passed their last offset.
//!
//! Durability contract: `append` only guarantees an OS-visible write; data is
//! durable after the next `sync_to_disk`, which the io pool ticks at
//! `binlog_sync_to_disk_interval`.

pub mod entry;
pub mod segment;

pub use entry::{Dimension, LogEntry, OpType, TsDimension};

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use segment::{scan_segment, segment_file_name, parse_segment_id, SegmentMeta, SegmentWriter};

pub struct LogPart {
    dir: PathBuf,
    single_file_max_size: u64,
    closed: RwLock<Vec<SegmentMeta>>,
    writer: Mutex<SegmentWriter>,
}

impl LogPart {
    /// Open (or create) the binlog directory, recovering segment metadata by
    /// scanning frames. A torn tail on the newest segment is truncated.
    pub fn open(dir: impl Into<PathBuf>, single_file_max_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut ids: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "log"))
            .map(|p| parse_segment_id(&p))
            .collect::<Result<Vec<_>>>()?;
        ids.sort_unstable();

        let mut metas = Vec::with_capacity(ids.len());
        for id in ids {
            let path = dir.join(segment_file_name(id));
            let (meta, torn) = scan_segment(id, &path)?;
            if torn > 0 {
                tracing::warn!(segment = id, torn_bytes = torn, "truncating torn segment tail");
            }
            metas.push(meta);
        }

        let active = match metas.pop() {
            Some(meta) => SegmentWriter::open(meta)?,
            None => SegmentWriter::create(0, &dir)?,
        };

        Ok(Self {
            dir,
            single_file_max_size,
            closed: RwLock::new(metas),
            writer: Mutex::new(active),
        })
    }

    /// Append one entry, rolling to a new segment when the active one is
    /// full. The write is flushed (not fsynced) so readers observe it.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut writer = self.writer.lock()?;
        if writer.meta().size >= self.single_file_max_size && !writer.meta().is_empty() {
            writer.sync()?;
            let next_id = writer.meta().id + 1;
            let full = writer.meta().clone();
            tracing::debug!(
                segment = full.id,
                last_offset = full.last_offset,
                "rolling binlog segment"
            );
            self.closed.write()?.push(full);
            *writer = SegmentWriter::create(next_id, &self.dir)?;
        }
        writer.append(entry)?;
        writer.flush()?;
        Ok(())
    }

    /// Fsync the active segment. Closed segments were synced when rolled.
    pub fn sync_to_disk(&self) -> Result<()> {
        self.writer.lock()?.sync()
    }

    /// Cursor over entries with offset >= `from_offset`.
    pub fn reader(&self, from_offset: u64) -> Result<LogReader> {
        let mut paths = Vec::new();
        for meta in self.closed.read()?.iter() {
            if meta.last_offset >= from_offset {
                paths.push(meta.path.clone());
            }
        }
        {
            let writer = self.writer.lock()?;
            paths.push(writer.meta().path.clone());
        }
        Ok(LogReader::new(paths, from_offset))
    }

    /// Delete closed segments whose last offset is below `offset`. The
    /// active segment is never deleted. Returns how many files were removed.
    pub fn truncate_before(&self, offset: u64) -> Result<usize> {
        let mut removed = 0;
        let mut closed = self.closed.write()?;
        closed.retain(|meta| {
            if meta.last_offset >= offset || meta.is_empty() {
                return true;
            }
            match fs::remove_file(&meta.path) {
                Ok(_) => {
                    tracing::info!(
                        segment = meta.id,
                        last_offset = meta.last_offset,
                        "deleted retired binlog segment"
                    );
                    removed += 1;
                    false
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    removed += 1;
                    false
                }
                Err(e) => {
                    tracing::warn!(segment = meta.id, error = %e, "failed to delete binlog segment");
                    true
                }
            }
        });
        Ok(removed)
    }

    /// Offset of the newest appended entry, zero when empty.
    pub fn last_offset(&self) -> u64 {
        let writer = self.writer.lock().unwrap();
        if !writer.meta().is_empty() {
            return writer.meta().last_offset;
        }
        self.closed
            .read()
            .unwrap()
            .last()
            .map(|m| m.last_offset)
            .unwrap_or(0)
    }

    pub fn segment_count(&self) -> usize {
        self.closed.read().unwrap().len() + 1
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Sequential reader over a frozen list of segment files. The cursor stops
/// at the first torn frame, which on the active segment simply means the
/// tail has not been flushed past that point yet.
pub struct LogReader {
    paths: Vec<PathBuf>,
    next_path: usize,
    current: Option<BufReader<File>>,
    from_offset: u64,
}

impl LogReader {
    fn new(paths: Vec<PathBuf>, from_offset: u64) -> Self {
        Self { paths, next_path: 0, current: None, from_offset }
    }

    fn read_next(&mut self) -> Result<Option<LogEntry>> {
        loop {
            if self.current.is_none() {
                if self.next_path >= self.paths.len() {
                    return Ok(None);
                }
                let file = match File::open(&self.paths[self.next_path]) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Segment retired between listing and open; skip it.
                        self.next_path += 1;
                        continue;
                    }
                    Err(e) => return Err(Error::Io(e.to_string())),
                };
                self.next_path += 1;
                self.current = Some(BufReader::new(file));
            }
            let reader = self.current.as_mut().unwrap();
            match entry::read_frame(reader) {
                Ok(Some(entry)) => {
                    if entry.offset < self.from_offset {
                        continue;
                    }
                    return Ok(Some(entry));
                }
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(Error::Corrupted(_)) => {
                    // Unflushed tail of the active segment.
                    self.current = None;
                    self.next_path = self.paths.len();
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64) -> LogEntry {
        let mut e = LogEntry::put(format!("k{offset}"), offset * 10, vec![b'v'; 16]);
        e.offset = offset;
        e
    }

    fn open_log(dir: &Path, max: u64) -> LogPart {
        LogPart::open(dir.join("binlog"), max).expect("open failed")
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_log(dir.path(), 1024 * 1024);
        for offset in 1..=10 {
            log.append(&entry(offset)).expect("append failed");
        }
        let offsets: Vec<u64> = log
            .reader(4)
            .expect("reader failed")
            .map(|e| e.expect("read failed").offset)
            .collect();
        assert_eq!(offsets, vec![4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(log.last_offset(), 10);
    }

    #[test]
    fn test_segment_roll() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_log(dir.path(), 128);
        for offset in 1..=20 {
            log.append(&entry(offset)).expect("append failed");
        }
        assert!(log.segment_count() > 1, "small cap should roll segments");

        let offsets: Vec<u64> = log
            .reader(1)
            .expect("reader failed")
            .map(|e| e.expect("read failed").offset)
            .collect();
        assert_eq!(offsets, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_reopen_recovers_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = open_log(dir.path(), 128);
            for offset in 1..=10 {
                log.append(&entry(offset)).expect("append failed");
            }
            log.sync_to_disk().expect("sync failed");
        }
        let log = open_log(dir.path(), 128);
        assert_eq!(log.last_offset(), 10);
        let offsets: Vec<u64> = log
            .reader(1)
            .expect("reader failed")
            .map(|e| e.expect("read failed").offset)
            .collect();
        assert_eq!(offsets.len(), 10);
    }

    #[test]
    fn test_truncate_before_keeps_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_log(dir.path(), 128);
        for offset in 1..=20 {
            log.append(&entry(offset)).expect("append failed");
        }
        let before = log.segment_count();
        assert!(before > 2);

        let removed = log.truncate_before(15).expect("truncate failed");
        assert!(removed > 0);

        // Everything from offset 15 on must still be readable.
        let offsets: Vec<u64> = log
            .reader(15)
            .expect("reader failed")
            .map(|e| e.expect("read failed").offset)
            .collect();
        assert_eq!(offsets, (15..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_truncate_all_below_keeps_log_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_log(dir.path(), 64);
        for offset in 1..=10 {
            log.append(&entry(offset)).expect("append failed");
        }
        log.truncate_before(u64::MAX).expect("truncate failed");
        log.append(&entry(11)).expect("append after truncate failed");
        assert_eq!(log.last_offset(), 11);
    }
}
