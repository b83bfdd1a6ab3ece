//! Table schema: column descriptors, index (column key) descriptors, TTL
//! descriptors, and the `table_meta.txt` text rendering.
//!
//! The text format is line oriented, one `key: value` record per line, so
//! that parse and print are a bijection on valid inputs and the file stays
//! readable in an editor during incident response.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableMode {
    Leader,
    Follower,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    Memory,
    Ssd,
    Hdd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    TimeSeries,
    Relational,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    Timestamp,
}

impl ColType {
    fn as_str(self) -> &'static str {
        match self {
            ColType::Bool => "bool",
            ColType::Int32 => "int32",
            ColType::Int64 => "int64",
            ColType::UInt64 => "uint64",
            ColType::Float => "float",
            ColType::Double => "double",
            ColType::String => "string",
            ColType::Timestamp => "timestamp",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "bool" => Ok(ColType::Bool),
            "int32" => Ok(ColType::Int32),
            "int64" => Ok(ColType::Int64),
            "uint64" => Ok(ColType::UInt64),
            "float" => Ok(ColType::Float),
            "double" => Ok(ColType::Double),
            "string" => Ok(ColType::String),
            "timestamp" => Ok(ColType::Timestamp),
            other => Err(Error::InvalidData(format!("unknown column type {other}"))),
        }
    }

    fn is_ts_capable(self) -> bool {
        matches!(self, ColType::Int64 | ColType::UInt64 | ColType::Timestamp)
    }

    fn is_float(self) -> bool {
        matches!(self, ColType::Float | ColType::Double)
    }
}

/// Eviction policy applied per (index, ts column).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlType {
    /// Drop entries older than `abs_ttl`.
    AbsoluteTime,
    /// Retain only the newest `lat_ttl` entries per key.
    LatestTime,
    /// Drop only when both the age and the count limits are exceeded.
    AbsAndLat,
    /// Drop when either limit is exceeded.
    AbsOrLat,
}

impl TtlType {
    fn as_str(self) -> &'static str {
        match self {
            TtlType::AbsoluteTime => "absolute",
            TtlType::LatestTime => "latest",
            TtlType::AbsAndLat => "abs_and_lat",
            TtlType::AbsOrLat => "abs_or_lat",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "absolute" => Ok(TtlType::AbsoluteTime),
            "latest" => Ok(TtlType::LatestTime),
            "abs_and_lat" => Ok(TtlType::AbsAndLat),
            "abs_or_lat" => Ok(TtlType::AbsOrLat),
            other => Err(Error::InvalidData(format!("unknown ttl type {other}"))),
        }
    }
}

/// TTL descriptor. `abs_ttl` is in minutes, `lat_ttl` is an entry count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlDesc {
    pub abs_ttl: u64,
    pub lat_ttl: u64,
    pub ttl_type: TtlType,
}

impl TtlDesc {
    pub fn new(abs_ttl: u64, lat_ttl: u64, ttl_type: TtlType) -> Self {
        Self { abs_ttl, lat_ttl, ttl_type }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub col_type: ColType,
    pub is_ts_col: bool,
    pub add_ts_idx: bool,
    pub abs_ttl: Option<u64>,
    pub lat_ttl: Option<u64>,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, col_type: ColType) -> Self {
        Self {
            name: name.into(),
            col_type,
            is_ts_col: false,
            add_ts_idx: false,
            abs_ttl: None,
            lat_ttl: None,
        }
    }

    pub fn ts_col(mut self) -> Self {
        self.is_ts_col = true;
        self
    }

    pub fn ts_idx(mut self) -> Self {
        self.add_ts_idx = true;
        self
    }

    pub fn ttl(mut self, abs: u64, lat: u64) -> Self {
        self.abs_ttl = Some(abs);
        self.lat_ttl = Some(lat);
        self
    }
}

/// An index descriptor: a named key over one or more columns, optionally
/// bound to one or more ts columns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnKey {
    pub index_name: String,
    pub col_names: Vec<String>,
    pub ts_names: Vec<String>,
}

impl ColumnKey {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            col_names: Vec::new(),
            ts_names: Vec::new(),
        }
    }

    pub fn cols(mut self, names: &[&str]) -> Self {
        self.col_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn ts(mut self, names: &[&str]) -> Self {
        self.ts_names = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub tid: u32,
    pub pid: u32,
    pub mode: TableMode,
    pub storage_mode: StorageMode,
    pub table_type: TableType,
    pub ttl_desc: Option<TtlDesc>,
    pub column_descs: Vec<ColumnDesc>,
    pub column_keys: Vec<ColumnKey>,
    pub replicas: Vec<String>,
    pub term: u64,
    pub seg_cnt: u32,
    pub added_column_descs: Vec<ColumnDesc>,
}

/// Derived index: id is the position in the index list, `ts_cols` the ids of
/// the ts columns this index writes under (empty means the single implicit
/// ts dimension).
#[derive(Clone, Debug, PartialEq)]
pub struct IndexDef {
    pub id: u32,
    pub name: String,
    pub ts_cols: Vec<u32>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>, tid: u32, pid: u32) -> Self {
        Self {
            name: name.into(),
            tid,
            pid,
            mode: TableMode::Leader,
            storage_mode: StorageMode::Memory,
            table_type: TableType::TimeSeries,
            ttl_desc: None,
            column_descs: Vec::new(),
            column_keys: Vec::new(),
            replicas: Vec::new(),
            term: 0,
            seg_cnt: 8,
            added_column_descs: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: TableMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn storage(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn table_type(mut self, t: TableType) -> Self {
        self.table_type = t;
        self
    }

    pub fn ttl(mut self, desc: TtlDesc) -> Self {
        self.ttl_desc = Some(desc);
        self
    }

    pub fn column(mut self, desc: ColumnDesc) -> Self {
        self.column_descs.push(desc);
        self
    }

    pub fn column_key(mut self, key: ColumnKey) -> Self {
        self.column_keys.push(key);
        self
    }

    pub fn replica(mut self, endpoint: impl Into<String>) -> Self {
        self.replicas.push(endpoint.into());
        self
    }

    pub fn is_leader(&self) -> bool {
        self.mode == TableMode::Leader
    }

    pub fn ttl_type(&self) -> TtlType {
        self.ttl_desc.map(|d| d.ttl_type).unwrap_or(TtlType::AbsoluteTime)
    }

    /// Names of ts columns, in declaration order; the position is the ts id
    /// used by ts dimensions.
    pub fn ts_mapping(&self) -> HashMap<String, u32> {
        let mut mapping = HashMap::new();
        let mut next = 0u32;
        for col in &self.column_descs {
            if col.is_ts_col {
                mapping.insert(col.name.clone(), next);
                next += 1;
            }
        }
        mapping
    }

    /// Derive the index list. Explicit column keys win; otherwise every
    /// `add_ts_idx` column is an index; a table with neither gets a single
    /// implicit index over the primary key.
    pub fn index_defs(&self) -> Vec<IndexDef> {
        let ts_mapping = self.ts_mapping();
        if !self.column_keys.is_empty() {
            return self
                .column_keys
                .iter()
                .enumerate()
                .map(|(id, key)| IndexDef {
                    id: id as u32,
                    name: key.index_name.clone(),
                    ts_cols: key
                        .ts_names
                        .iter()
                        .filter_map(|n| ts_mapping.get(n).copied())
                        .collect(),
                })
                .collect();
        }
        let mut defs: Vec<IndexDef> = self
            .column_descs
            .iter()
            .filter(|c| c.add_ts_idx)
            .enumerate()
            .map(|(id, c)| IndexDef {
                id: id as u32,
                name: c.name.clone(),
                ts_cols: Vec::new(),
            })
            .collect();
        if defs.is_empty() {
            defs.push(IndexDef { id: 0, name: self.name.clone(), ts_cols: Vec::new() });
        }
        defs
    }

    /// Per-(ts column) TTL descriptors, falling back to the table TTL.
    pub fn ts_ttls(&self) -> Vec<TtlDesc> {
        let table_ttl = self
            .ttl_desc
            .unwrap_or(TtlDesc::new(0, 0, TtlType::AbsoluteTime));
        let ts_cols: Vec<&ColumnDesc> =
            self.column_descs.iter().filter(|c| c.is_ts_col).collect();
        if ts_cols.is_empty() {
            return vec![table_ttl];
        }
        ts_cols
            .iter()
            .map(|c| TtlDesc {
                abs_ttl: c.abs_ttl.unwrap_or(table_ttl.abs_ttl),
                lat_ttl: c.lat_ttl.unwrap_or(table_ttl.lat_ttl),
                ttl_type: table_ttl.ttl_type,
            })
            .collect()
    }

    /// Schema invariants, enforced at create and load time.
    pub fn validate(&self, absolute_ttl_max: u64, latest_ttl_max: u64) -> Result<()> {
        if self.name.is_empty() {
            return errinput!("table name is empty");
        }
        if self.tid == 0 {
            return errinput!("tid is zero");
        }
        if let Some(ttl) = &self.ttl_desc {
            if ttl.abs_ttl > absolute_ttl_max || ttl.lat_ttl > latest_ttl_max {
                return errinput!(
                    "ttl is greater than conf value. max abs_ttl is {absolute_ttl_max}, max lat_ttl is {latest_ttl_max}"
                );
            }
        }

        let mut column_map: HashMap<&str, ColType> = HashMap::new();
        let mut ts_set: HashSet<&str> = HashSet::new();
        for col in &self.column_descs {
            if column_map.contains_key(col.name.as_str()) {
                return errinput!("has repeated column name {}", col.name);
            }
            if col.is_ts_col {
                if col.add_ts_idx {
                    return errinput!(
                        "can not set add_ts_idx and is_ts_col together. column name {}",
                        col.name
                    );
                }
                if !col.col_type.is_ts_capable() {
                    return errinput!("ttl column type must be int64, uint64, timestamp");
                }
                if let (Some(abs), Some(lat)) = (col.abs_ttl, col.lat_ttl) {
                    if abs > absolute_ttl_max || lat > latest_ttl_max {
                        return errinput!(
                            "ttl is greater than conf value. max abs_ttl is {absolute_ttl_max}, max lat_ttl is {latest_ttl_max}"
                        );
                    }
                }
                ts_set.insert(col.name.as_str());
            }
            if col.add_ts_idx && col.col_type.is_float() {
                return errinput!("float or double column can not be index");
            }
            column_map.insert(col.name.as_str(), col.col_type);
        }

        let mut index_set: HashSet<&str> = HashSet::new();
        for key in &self.column_keys {
            if !index_set.insert(key.index_name.as_str()) {
                return errinput!("has repeated index name {}", key.index_name);
            }
            if key.col_names.is_empty() {
                match column_map.get(key.index_name.as_str()) {
                    None => {
                        return errinput!(
                            "index must be a member of columns when column key col name is empty"
                        )
                    }
                    Some(t) if t.is_float() => {
                        return errinput!("float or double column can not be index")
                    }
                    Some(_) => {}
                }
            }
            for col_name in &key.col_names {
                match column_map.get(col_name.as_str()) {
                    None => return errinput!("not found column name {col_name}"),
                    Some(t) if t.is_float() => {
                        return errinput!("float or double column can not be index {col_name}")
                    }
                    Some(_) => {}
                }
                if ts_set.contains(col_name.as_str()) {
                    return errinput!(
                        "column name in column key can not set ts col. column name {col_name}"
                    );
                }
            }
            let mut ts_name_set: HashSet<&str> = HashSet::new();
            for ts_name in &key.ts_names {
                if !ts_set.contains(ts_name.as_str()) {
                    return errinput!("not found ts_name {ts_name}");
                }
                if !ts_name_set.insert(ts_name.as_str()) {
                    return errinput!("has repeated ts_name {ts_name}");
                }
            }
            if ts_set.len() > 1 && key.ts_names.is_empty() {
                return errinput!("ts column num more than one, must set ts name");
            }
        }
        if self.column_keys.is_empty() && ts_set.len() > 1 {
            return errinput!("column_key should be set when has two or more ts columns");
        }

        let mut added_set: HashSet<&str> = HashSet::new();
        for col in &self.added_column_descs {
            if column_map.contains_key(col.name.as_str()) || !added_set.insert(col.name.as_str()) {
                return errinput!("has repeated column name {}", col.name);
            }
        }

        if self.table_type == TableType::Relational {
            if !ts_set.is_empty() {
                return errinput!("relational table can not have ts columns");
            }
            if self.column_keys.is_empty() {
                return errinput!("relational table must set a primary column key");
            }
        }
        Ok(())
    }

    // ===== text rendering =====

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        writeln!(out, "name: {}", self.name).unwrap();
        writeln!(out, "tid: {}", self.tid).unwrap();
        writeln!(out, "pid: {}", self.pid).unwrap();
        let mode = match self.mode {
            TableMode::Leader => "leader",
            TableMode::Follower => "follower",
        };
        writeln!(out, "mode: {mode}").unwrap();
        let storage = match self.storage_mode {
            StorageMode::Memory => "memory",
            StorageMode::Ssd => "ssd",
            StorageMode::Hdd => "hdd",
        };
        writeln!(out, "storage_mode: {storage}").unwrap();
        let table_type = match self.table_type {
            TableType::TimeSeries => "time_series",
            TableType::Relational => "relational",
        };
        writeln!(out, "table_type: {table_type}").unwrap();
        writeln!(out, "term: {}", self.term).unwrap();
        writeln!(out, "seg_cnt: {}", self.seg_cnt).unwrap();
        if let Some(ttl) = &self.ttl_desc {
            writeln!(
                out,
                "ttl: abs={} lat={} type={}",
                ttl.abs_ttl,
                ttl.lat_ttl,
                ttl.ttl_type.as_str()
            )
            .unwrap();
        }
        for col in &self.column_descs {
            out.push_str(&Self::column_line("column", col));
        }
        for key in &self.column_keys {
            write!(out, "column_key: {}", key.index_name).unwrap();
            if !key.col_names.is_empty() {
                write!(out, " cols={}", key.col_names.join(",")).unwrap();
            }
            if !key.ts_names.is_empty() {
                write!(out, " ts={}", key.ts_names.join(",")).unwrap();
            }
            out.push('\n');
        }
        for col in &self.added_column_descs {
            out.push_str(&Self::column_line("added_column", col));
        }
        for replica in &self.replicas {
            writeln!(out, "replica: {replica}").unwrap();
        }
        out
    }

    fn column_line(tag: &str, col: &ColumnDesc) -> String {
        let mut line = format!("{tag}: {} {}", col.name, col.col_type.as_str());
        if col.is_ts_col {
            line.push_str(" ts_col");
        }
        if col.add_ts_idx {
            line.push_str(" ts_idx");
        }
        if let Some(abs) = col.abs_ttl {
            write!(line, " abs_ttl={abs}").unwrap();
        }
        if let Some(lat) = col.lat_ttl {
            write!(line, " lat_ttl={lat}").unwrap();
        }
        line.push('\n');
        line
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut meta = TableMeta::new("", 0, 0);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| Error::InvalidData(format!("bad table meta line: {line}")))?;
            match key {
                "name" => meta.name = value.to_string(),
                "tid" => meta.tid = parse_num(value)?,
                "pid" => meta.pid = parse_num(value)?,
                "mode" => {
                    meta.mode = match value {
                        "leader" => TableMode::Leader,
                        "follower" => TableMode::Follower,
                        other => return Err(Error::InvalidData(format!("unknown mode {other}"))),
                    }
                }
                "storage_mode" => {
                    meta.storage_mode = match value {
                        "memory" => StorageMode::Memory,
                        "ssd" => StorageMode::Ssd,
                        "hdd" => StorageMode::Hdd,
                        other => {
                            return Err(Error::InvalidData(format!("unknown storage mode {other}")))
                        }
                    }
                }
                "table_type" => {
                    meta.table_type = match value {
                        "time_series" => TableType::TimeSeries,
                        "relational" => TableType::Relational,
                        other => {
                            return Err(Error::InvalidData(format!("unknown table type {other}")))
                        }
                    }
                }
                "term" => meta.term = parse_num(value)?,
                "seg_cnt" => meta.seg_cnt = parse_num(value)?,
                "ttl" => meta.ttl_desc = Some(Self::parse_ttl_line(value)?),
                "column" => meta.column_descs.push(Self::parse_column_line(value)?),
                "added_column" => meta.added_column_descs.push(Self::parse_column_line(value)?),
                "column_key" => meta.column_keys.push(Self::parse_column_key_line(value)?),
                "replica" => meta.replicas.push(value.to_string()),
                other => return Err(Error::InvalidData(format!("unknown table meta key {other}"))),
            }
        }
        Ok(meta)
    }

    fn parse_ttl_line(value: &str) -> Result<TtlDesc> {
        let mut abs = 0u64;
        let mut lat = 0u64;
        let mut ttl_type = TtlType::AbsoluteTime;
        for part in value.split_whitespace() {
            match part.split_once('=') {
                Some(("abs", v)) => abs = parse_num(v)?,
                Some(("lat", v)) => lat = parse_num(v)?,
                Some(("type", v)) => ttl_type = TtlType::parse(v)?,
                _ => return Err(Error::InvalidData(format!("bad ttl field {part}"))),
            }
        }
        Ok(TtlDesc::new(abs, lat, ttl_type))
    }

    fn parse_column_line(value: &str) -> Result<ColumnDesc> {
        let mut parts = value.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::InvalidData("column line missing name".into()))?;
        let col_type = ColType::parse(
            parts
                .next()
                .ok_or_else(|| Error::InvalidData("column line missing type".into()))?,
        )?;
        let mut col = ColumnDesc::new(name, col_type);
        for flag in parts {
            match flag.split_once('=') {
                Some(("abs_ttl", v)) => col.abs_ttl = Some(parse_num(v)?),
                Some(("lat_ttl", v)) => col.lat_ttl = Some(parse_num(v)?),
                None if flag == "ts_col" => col.is_ts_col = true,
                None if flag == "ts_idx" => col.add_ts_idx = true,
                _ => return Err(Error::InvalidData(format!("bad column flag {flag}"))),
            }
        }
        Ok(col)
    }

    fn parse_column_key_line(value: &str) -> Result<ColumnKey> {
        let mut parts = value.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::InvalidData("column_key line missing name".into()))?;
        let mut key = ColumnKey::new(name);
        for field in parts {
            match field.split_once('=') {
                Some(("cols", v)) => {
                    key.col_names = v.split(',').map(str::to_string).collect();
                }
                Some(("ts", v)) => {
                    key.ts_names = v.split(',').map(str::to_string).collect();
                }
                _ => return Err(Error::InvalidData(format!("bad column_key field {field}"))),
            }
        }
        Ok(key)
    }

    /// Write `table_meta.txt` atomically: write a temp file, then rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join("table_meta.txt.tmp");
        fs::write(&tmp, self.to_text())?;
        fs::rename(&tmp, dir.join("table_meta.txt"))?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join("table_meta.txt"))?;
        Self::from_text(&text)
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::InvalidData(format!("bad number {s}")))
}
