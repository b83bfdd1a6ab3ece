//! Log entry codec.
//!
//! Each entry is framed as:
//!
//! ```text
//! +-----------+-------------------+-----------+
//! |length:u32 | bincode(LogEntry) |crc32:u32  |
//! +-----------+-------------------+-----------+
//! | 4 bytes   | variable length   | 4 bytes   |
//! +-----------+-------------------+-----------+
//! ```
//!
//! Big-endian lengths and CRC-32/iSCSI checksums. The same frames make up
//! binlog segments and memory-table snapshot dumps, so snapshot recovery and
//! binlog replay share one decode path.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Put,
    Delete,
}

/// One index write: the key under the index identified by `idx`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub key: String,
    pub idx: u32,
}

impl Dimension {
    pub fn new(key: impl Into<String>, idx: u32) -> Self {
        Self { key: key.into(), idx }
    }
}

/// One ts-column timestamp for a multi-ts write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsDimension {
    pub ts: u64,
    pub idx: u32,
}

impl TsDimension {
    pub fn new(ts: u64, idx: u32) -> Self {
        Self { ts, idx }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    pub term: u64,
    pub op: OpType,
    pub pk: String,
    pub ts: u64,
    pub value: Vec<u8>,
    pub dimensions: Vec<Dimension>,
    pub ts_dimensions: Vec<TsDimension>,
}

impl LogEntry {
    pub fn put(pk: impl Into<String>, ts: u64, value: Vec<u8>) -> Self {
        Self {
            offset: 0,
            term: 0,
            op: OpType::Put,
            pk: pk.into(),
            ts,
            value,
            dimensions: Vec::new(),
            ts_dimensions: Vec::new(),
        }
    }

    pub fn delete(pk: impl Into<String>, idx: u32) -> Self {
        Self {
            offset: 0,
            term: 0,
            op: OpType::Delete,
            pk: pk.into(),
            ts: 0,
            value: Vec::new(),
            dimensions: vec![Dimension::new("", idx)],
            ts_dimensions: Vec::new(),
        }
    }

    pub fn dims(mut self, dims: Vec<Dimension>) -> Self {
        self.dimensions = dims;
        self
    }

    pub fn ts_dims(mut self, dims: Vec<TsDimension>) -> Self {
        self.ts_dimensions = dims;
        self
    }
}

/// Encode an entry into a framed byte vector.
pub fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry)?;
    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.write_u32::<BigEndian>(body.len() as u32)?;
    buf.extend_from_slice(&body);
    buf.write_u32::<BigEndian>(CRC32.checksum(&body))?;
    Ok(buf)
}

/// Decode the next frame. Returns `Ok(None)` on a clean EOF at a frame
/// boundary; a frame torn mid-way or failing its checksum is `Corrupted`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e.to_string())),
    };
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Corrupted("unexpected eof while reading entry body".to_string())
            }
            _ => Error::Io(e.to_string()),
        })?;
    let stored = reader.read_u32::<BigEndian>().map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            Error::Corrupted("unexpected eof while reading entry checksum".to_string())
        }
        _ => Error::Io(e.to_string()),
    })?;
    let computed = CRC32.checksum(&body);
    if stored != computed {
        return Err(Error::Corrupted(format!(
            "entry checksum mismatch: stored={stored}, computed={computed}"
        )));
    }
    let entry = bincode::deserialize(&body)?;
    Ok(Some(entry))
}
