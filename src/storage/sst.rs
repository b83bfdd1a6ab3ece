//! Immutable sorted-run files for the disk engine.
//!
//! A run holds `(composite key, value)` records in key order:
//!
//! ```text
//! +-----------+-----+-----------+-------+-----------+
//! |klen:u32   | key |vlen:u32   | value |crc32:u32  |
//! +-----------+-----+-----------+-------+-----------+
//! ```
//!
//! Keys are small (index id + user key + ts column + timestamp), so the
//! reader keeps every key in memory mapped to its value location and reads
//! values on demand. Runs are written once by a flush and never modified.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn run_file_name(id: u64) -> String {
    format!("{:08}.sst", id)
}

pub fn parse_run_id(path: &Path) -> Result<u64> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(".sst"))
        .and_then(|num| num.parse::<u64>().ok())
        .ok_or_else(|| Error::InvalidData(format!("invalid run file name: {path:?}")))
}

pub struct SstWriter {
    path: PathBuf,
    file: File,
    writer: BufWriter<File>,
    count: u64,
    last_key: Option<Vec<u8>>,
}

impl SstWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self { path, file, writer, count: 0, last_key: None })
    }

    /// Append one record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return errdata!("out of order key in sorted run");
            }
        }
        self.writer.write_u32::<BigEndian>(key.len() as u32)?;
        self.writer.write_all(key)?;
        self.writer.write_u32::<BigEndian>(value.len() as u32)?;
        self.writer.write_all(value)?;
        let mut crc = CRC32.digest();
        crc.update(key);
        crc.update(value);
        self.writer.write_u32::<BigEndian>(crc.finalize())?;
        self.count += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush and fsync; the run is immutable afterwards.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(self.path)
    }
}

/// Location of a value within the run file.
#[derive(Clone, Copy, Debug)]
struct ValueLoc {
    offset: u64,
    len: u32,
}

pub struct SstReader {
    path: PathBuf,
    index: BTreeMap<Vec<u8>, ValueLoc>,
    file: Mutex<File>,
}

impl SstReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file.try_clone()?);
        let mut index = BTreeMap::new();
        let mut pos = 0u64;
        loop {
            let klen = match reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e.to_string())),
            };
            let mut key = vec![0u8; klen];
            reader.read_exact(&mut key).map_err(|_| {
                Error::Corrupted(format!("truncated key in run {path:?}"))
            })?;
            let vlen = reader.read_u32::<BigEndian>().map_err(|_| {
                Error::Corrupted(format!("truncated value length in run {path:?}"))
            })?;
            let value_offset = pos + 4 + klen as u64 + 4;
            // Skip the value and verify the frame checksum.
            let mut value = vec![0u8; vlen as usize];
            reader.read_exact(&mut value).map_err(|_| {
                Error::Corrupted(format!("truncated value in run {path:?}"))
            })?;
            let stored = reader.read_u32::<BigEndian>().map_err(|_| {
                Error::Corrupted(format!("truncated checksum in run {path:?}"))
            })?;
            let mut crc = CRC32.digest();
            crc.update(&key);
            crc.update(&value);
            if crc.finalize() != stored {
                return Err(Error::Corrupted(format!("checksum mismatch in run {path:?}")));
            }
            index.insert(key, ValueLoc { offset: value_offset, len: vlen });
            pos = value_offset + vlen as u64 + 4;
        }
        Ok(Self { path, index, file: Mutex::new(file) })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest key at or after `from` (exclusive when `excl`).
    pub fn next_key(&self, from: &[u8], excl: bool) -> Option<&[u8]> {
        let lower = if excl {
            Bound::Excluded(from.to_vec())
        } else {
            Bound::Included(from.to_vec())
        };
        self.index
            .range::<Vec<u8>, _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, _)| k.as_slice())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let loc = match self.index.get(key) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut value = vec![0u8; loc.len as usize];
        file.read_exact(&mut value)?;
        Ok(Some(value))
    }
}
