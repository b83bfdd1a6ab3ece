//! Relational engine: a single primary-key-ordered store of rows.
//!
//! Rows are positional `Datum` tuples encoded with bincode; the primary key
//! is the first column of the table's first column key, rendered with an
//! order-preserving encoding so traversal yields rows in key order. No TTL,
//! no ts columns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta::{ColType, TableMeta};
use crate::storage::{TableCore, ValueRef};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Timestamp(u64),
}

/// Encode a row for storage.
pub fn encode_row(row: &[Datum]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(row)?)
}

pub fn decode_row(bytes: &[u8]) -> Result<Vec<Datum>> {
    Ok(bincode::deserialize(bytes)?)
}

/// Order-preserving encoding of one primary-key datum. Sign bits are
/// flipped so negative integers sort before positive ones; strings are
/// 0x00-escaped and terminated so no key is a prefix of another.
fn encode_pk_datum(datum: &Datum, out: &mut Vec<u8>) -> Result<()> {
    match datum {
        Datum::Bool(b) => out.push(if *b { 1 } else { 0 }),
        Datum::Int32(i) => {
            let unsigned = (*i as u32) ^ (1u32 << 31);
            out.extend_from_slice(&unsigned.to_be_bytes());
        }
        Datum::Int64(i) => {
            let unsigned = (*i as u64) ^ (1u64 << 63);
            out.extend_from_slice(&unsigned.to_be_bytes());
        }
        Datum::UInt64(u) | Datum::Timestamp(u) => out.extend_from_slice(&u.to_be_bytes()),
        Datum::Str(s) => {
            for &b in s.as_bytes() {
                out.push(b);
                if b == 0 {
                    out.push(0xff);
                }
            }
            out.push(0);
            out.push(0);
        }
        Datum::Null | Datum::Float(_) | Datum::Double(_) => {
            return errinput!("datum can not be a primary key")
        }
    }
    Ok(())
}

pub struct RelationalTable {
    core: TableCore,
    entries: Arc<SkipMap<Vec<u8>, ValueRef>>,
    /// Position and type of the primary-key column within the row.
    pk_col: (usize, ColType),
    record_cnt: AtomicU64,
}

impl RelationalTable {
    pub fn new(meta: TableMeta) -> Result<Self> {
        let key = meta
            .column_keys
            .first()
            .ok_or_else(|| Error::InvalidInput("relational table has no column key".into()))?;
        let pk_name = key
            .col_names
            .first()
            .cloned()
            .unwrap_or_else(|| key.index_name.clone());
        let pk_col = meta
            .column_descs
            .iter()
            .position(|c| c.name == pk_name)
            .map(|pos| (pos, meta.column_descs[pos].col_type))
            .ok_or_else(|| {
                Error::InvalidInput(format!("primary key column {pk_name} not found"))
            })?;
        Ok(Self {
            core: TableCore::new(meta),
            entries: Arc::new(SkipMap::new()),
            pk_col,
            record_cnt: AtomicU64::new(0),
        })
    }

    pub fn core(&self) -> &TableCore {
        &self.core
    }

    fn pk_of_row(&self, row: &[Datum]) -> Result<Vec<u8>> {
        let datum = row
            .get(self.pk_col.0)
            .ok_or_else(|| Error::InvalidInput("row is missing the primary key column".into()))?;
        let mut out = Vec::new();
        encode_pk_datum(datum, &mut out)?;
        Ok(out)
    }

    /// Render a client-supplied key string into the stored key encoding.
    fn pk_of_str(&self, key: &str) -> Result<Vec<u8>> {
        let datum = match self.pk_col.1 {
            ColType::String => Datum::Str(key.to_string()),
            ColType::Bool => Datum::Bool(key == "true" || key == "1"),
            ColType::Int32 => Datum::Int32(
                key.parse()
                    .map_err(|_| Error::InvalidInput(format!("bad int32 key {key}")))?,
            ),
            ColType::Int64 => Datum::Int64(
                key.parse()
                    .map_err(|_| Error::InvalidInput(format!("bad int64 key {key}")))?,
            ),
            ColType::UInt64 => Datum::UInt64(
                key.parse()
                    .map_err(|_| Error::InvalidInput(format!("bad uint64 key {key}")))?,
            ),
            ColType::Timestamp => Datum::Timestamp(
                key.parse()
                    .map_err(|_| Error::InvalidInput(format!("bad timestamp key {key}")))?,
            ),
            ColType::Float | ColType::Double => {
                return errinput!("float or double column can not be a primary key")
            }
        };
        let mut out = Vec::new();
        encode_pk_datum(&datum, &mut out)?;
        Ok(out)
    }

    /// Insert or replace a row; the primary key comes out of the row itself.
    pub fn put(&self, value: &[u8]) -> Result<()> {
        let row = decode_row(value)?;
        let pk = self.pk_of_row(&row)?;
        if self.entries.get(&pk).is_none() {
            self.record_cnt.fetch_add(1, Ordering::SeqCst);
        }
        self.entries.insert(pk, Arc::new(value.to_vec()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let pk = self.pk_of_str(key)?;
        Ok(self.entries.get(&pk).map(|e| e.value().to_vec()))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let pk = self.pk_of_str(key)?;
        match self.entries.remove(&pk) {
            Some(_) => {
                self.record_cnt.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Update columns of the row matched by equality conditions. Conditions
    /// must pin the primary key; changing the key itself is rejected.
    pub fn update(
        &self,
        conditions: &[(String, Datum)],
        values: &[(String, Datum)],
    ) -> Result<bool> {
        let meta = self.core.meta();
        let pk_name = &meta.column_descs[self.pk_col.0].name;
        let pk_cond = conditions
            .iter()
            .find(|(name, _)| name == pk_name)
            .ok_or_else(|| Error::InvalidInput("update conditions must pin the primary key".into()))?;
        if values.iter().any(|(name, _)| name == pk_name) {
            return errinput!("can not update the primary key column");
        }
        let mut pk = Vec::new();
        encode_pk_datum(&pk_cond.1, &mut pk)?;

        let Some(entry) = self.entries.get(&pk) else { return Ok(false) };
        let mut row = decode_row(entry.value())?;

        let col_pos = |name: &str| -> Option<usize> {
            meta.column_descs
                .iter()
                .chain(meta.added_column_descs.iter())
                .position(|c| c.name == name)
        };
        for (name, _) in conditions {
            let pos = col_pos(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown condition column {name}")))?;
            let expect = conditions.iter().find(|(n, _)| n == name).map(|(_, d)| d).unwrap();
            if row.get(pos).unwrap_or(&Datum::Null) != expect {
                return Ok(false);
            }
        }
        for (name, datum) in values {
            let pos = col_pos(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown value column {name}")))?;
            if pos >= row.len() {
                row.resize(pos + 1, Datum::Null);
            }
            row[pos] = datum.clone();
        }
        self.entries.insert(pk, Arc::new(encode_row(&row)?));
        Ok(true)
    }

    /// Resolve a list of keys in one pass.
    pub fn batch_query(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn traverse(&self) -> RelationalTraverseIterator {
        RelationalTraverseIterator {
            entries: self.entries.clone(),
            cur: None,
            steps: 0,
        }
    }

    pub fn record_cnt(&self) -> u64 {
        self.record_cnt.load(Ordering::SeqCst)
    }
}

/// Key-ordered cursor over rows.
pub struct RelationalTraverseIterator {
    entries: Arc<SkipMap<Vec<u8>, ValueRef>>,
    cur: Option<(Vec<u8>, ValueRef)>,
    steps: u64,
}

impl RelationalTraverseIterator {
    pub fn seek_to_first(&mut self) {
        self.cur = self
            .entries
            .front()
            .map(|e| (e.key().clone(), e.value().clone()));
        if self.cur.is_some() {
            self.steps += 1;
        }
    }

    /// Position at `key` when present, else at the first row after it.
    pub fn seek(&mut self, table: &RelationalTable, key: &str) -> Result<()> {
        use std::ops::Bound;
        let pk = table.pk_of_str(key)?;
        self.cur = self
            .entries
            .range((Bound::Included(pk), Bound::Unbounded))
            .next()
            .map(|e| (e.key().clone(), e.value().clone()));
        if self.cur.is_some() {
            self.steps += 1;
        }
        Ok(())
    }

    pub fn next(&mut self) {
        use std::ops::Bound;
        let Some((cur_key, _)) = &self.cur else { return };
        self.cur = self
            .entries
            .range((Bound::Excluded(cur_key.clone()), Bound::Unbounded))
            .next()
            .map(|e| (e.key().clone(), e.value().clone()));
        if self.cur.is_some() {
            self.steps += 1;
        }
    }

    pub fn valid(&self) -> bool {
        self.cur.is_some()
    }

    pub fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}
