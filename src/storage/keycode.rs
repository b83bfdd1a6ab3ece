//! Order-preserving composite key encoding for the disk engine.
//!
//! A disk entry is keyed by `(index_id, user_key, ts_column_id, !ts)`. The
//! timestamp is stored bitwise-inverted so that the byte order of the
//! composite key iterates each `(index, key, ts column)` group newest first,
//! matching the memory engine's skip lists.
//!
//! The user key is escaped so keys of different lengths cannot collide with
//! one another's suffixes: each 0x00 byte becomes 0x00 0xff, and the key is
//! terminated with 0x00 0x00. The terminator sorts below every escaped byte,
//! preserving prefix order.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

const ESCAPE: u8 = 0x00;
const ESCAPED: u8 = 0xff;

fn encode_user_key(key: &[u8], out: &mut Vec<u8>) {
    for &b in key {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED);
        }
    }
    out.push(ESCAPE);
    out.push(ESCAPE);
}

fn decode_user_key(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut key = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == ESCAPE {
            if i + 1 >= buf.len() {
                return Err(Error::InvalidData("truncated user key escape".to_string()));
            }
            match buf[i + 1] {
                ESCAPE => return Ok((key, i + 2)),
                ESCAPED => {
                    key.push(ESCAPE);
                    i += 2;
                }
                _ => return Err(Error::InvalidData("bad user key escape".to_string())),
            }
        } else {
            key.push(buf[i]);
            i += 1;
        }
    }
    Err(Error::InvalidData("unterminated user key".to_string()))
}

/// Full composite key for one entry.
pub fn encode_combined(idx: u32, pk: &[u8], ts_col: u32, ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(pk.len() + 18);
    out.extend_from_slice(&idx.to_be_bytes());
    encode_user_key(pk, &mut out);
    out.extend_from_slice(&ts_col.to_be_bytes());
    out.extend_from_slice(&(!ts).to_be_bytes());
    out
}

/// Prefix selecting every entry of one `(index, key, ts column)` group.
pub fn encode_ts_prefix(idx: u32, pk: &[u8], ts_col: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(pk.len() + 10);
    out.extend_from_slice(&idx.to_be_bytes());
    encode_user_key(pk, &mut out);
    out.extend_from_slice(&ts_col.to_be_bytes());
    out
}

/// Prefix selecting every entry of one `(index, key)` pair across ts columns.
pub fn encode_key_prefix(idx: u32, pk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pk.len() + 6);
    out.extend_from_slice(&idx.to_be_bytes());
    encode_user_key(pk, &mut out);
    out
}

/// Prefix selecting every entry of one index.
pub fn encode_index_prefix(idx: u32) -> Vec<u8> {
    idx.to_be_bytes().to_vec()
}

pub fn decode_combined(buf: &[u8]) -> Result<(u32, Vec<u8>, u32, u64)> {
    if buf.len() < 4 {
        return Err(Error::InvalidData("combined key too short".to_string()));
    }
    let idx = BigEndian::read_u32(&buf[0..4]);
    let (pk, consumed) = decode_user_key(&buf[4..])?;
    let rest = &buf[4 + consumed..];
    if rest.len() != 12 {
        return Err(Error::InvalidData("combined key tail malformed".to_string()));
    }
    let ts_col = BigEndian::read_u32(&rest[0..4]);
    let ts = !BigEndian::read_u64(&rest[4..12]);
    Ok((idx, pk, ts_col, ts))
}

/// The exclusive upper bound for a prefix range: the prefix with its last
/// non-0xff byte bumped. `None` means the range is unbounded above.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    prefix.iter().rposition(|b| *b != 0xff).map(|i| {
        let mut upper = prefix[..=i].to_vec();
        upper[i] += 1;
        upper
    })
}
