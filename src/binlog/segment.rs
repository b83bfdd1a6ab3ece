use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::binlog::entry::{encode_frame, read_frame, LogEntry};
use crate::error::{Error, Result};

/// Metadata for one binlog segment file. `first_offset`/`last_offset` are
/// zero until the segment holds at least one entry.
#[derive(Clone, Debug)]
pub struct SegmentMeta {
    pub id: u64,
    pub path: PathBuf,
    pub first_offset: u64,
    pub last_offset: u64,
    pub size: u64,
}

impl SegmentMeta {
    pub fn is_empty(&self) -> bool {
        self.first_offset == 0 && self.last_offset == 0
    }
}

pub fn segment_file_name(id: u64) -> String {
    format!("{:08}.log", id)
}

/// Parse the numeric segment id out of a segment file name.
pub fn parse_segment_id(path: &Path) -> Result<u64> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(".log"))
        .and_then(|num| num.parse::<u64>().ok())
        .ok_or_else(|| Error::InvalidData(format!("invalid segment file name: {path:?}")))
}

/// Scan a segment file, returning its metadata. A torn trailing frame is
/// tolerated: the scan stops at the last valid frame boundary and reports the
/// valid byte length so the caller can truncate before appending.
pub fn scan_segment(id: u64, path: &Path) -> Result<(SegmentMeta, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut first_offset = 0u64;
    let mut last_offset = 0u64;
    let mut valid_len = 0u64;
    loop {
        match read_frame(&mut reader) {
            Ok(Some(entry)) => {
                if first_offset == 0 {
                    first_offset = entry.offset;
                }
                last_offset = entry.offset;
                valid_len = reader.stream_position()?;
            }
            Ok(None) => break,
            Err(Error::Corrupted(msg)) => {
                tracing::warn!(segment = id, error = %msg, "torn frame at segment tail");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let size = std::fs::metadata(path)?.len();
    Ok((
        SegmentMeta { id, path: path.to_path_buf(), first_offset, last_offset, size: valid_len },
        if size > valid_len { size - valid_len } else { 0 },
    ))
}

/// Append side of the active segment.
pub struct SegmentWriter {
    meta: SegmentMeta,
    file: File,
    writer: BufWriter<File>,
}

impl SegmentWriter {
    /// Open a segment for appending, positioned after the last valid frame.
    pub fn open(meta: SegmentMeta) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&meta.path)?;
        // Drop any torn tail left by a crash before we append after it.
        file.set_len(meta.size)?;
        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::Start(meta.size))?;
        Ok(Self { meta, file, writer })
    }

    pub fn create(id: u64, dir: &Path) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let meta =
            SegmentMeta { id, path, first_offset: 0, last_offset: 0, size: 0 };
        Self::open(meta)
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        self.writer.write_all(&frame)?;
        if self.meta.first_offset == 0 {
            self.meta.first_offset = entry.offset;
        }
        self.meta.last_offset = entry.offset;
        self.meta.size += frame.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush buffered frames so a concurrent reader can observe them.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn entry(offset: u64) -> LogEntry {
        let mut e = LogEntry::put(format!("k{offset}"), offset * 10, b"v".to_vec());
        e.offset = offset;
        e
    }

    #[test]
    fn test_scan_recovers_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = SegmentWriter::create(1, dir.path()).expect("create failed");
        for offset in 1..=5 {
            writer.append(&entry(offset)).expect("append failed");
        }
        writer.sync().expect("sync failed");

        let path = dir.path().join(segment_file_name(1));
        let (meta, torn) = scan_segment(1, &path).expect("scan failed");
        assert_eq!(meta.first_offset, 1);
        assert_eq!(meta.last_offset, 5);
        assert_eq!(torn, 0);
    }

    #[test]
    fn test_scan_tolerates_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = SegmentWriter::create(1, dir.path()).expect("create failed");
        writer.append(&entry(1)).expect("append failed");
        writer.sync().expect("sync failed");

        let path = dir.path().join(segment_file_name(1));
        let mut file = OpenOptions::new().append(true).open(&path).expect("open failed");
        file.write_all(&[0, 0, 0, 42, 1, 2, 3]).expect("write garbage failed");
        file.sync_all().expect("sync failed");

        let (meta, torn) = scan_segment(1, &path).expect("scan failed");
        assert_eq!(meta.last_offset, 1);
        assert!(torn > 0);

        // Reopening for append truncates the torn tail.
        let mut writer = SegmentWriter::open(meta).expect("open failed");
        writer.append(&entry(2)).expect("append failed");
        writer.sync().expect("sync failed");
        let (meta, torn) = scan_segment(1, &path).expect("rescan failed");
        assert_eq!(meta.last_offset, 2);
        assert_eq!(torn, 0);
    }

    #[test]
    fn test_parse_segment_id() {
        assert_eq!(parse_segment_id(Path::new("/x/00000007.log")).unwrap(), 7);
        assert!(parse_segment_id(Path::new("/x/nope.txt")).is_err());
    }
}
