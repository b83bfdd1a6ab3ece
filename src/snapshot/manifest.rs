//! The `MANIFEST` text file: which dump a snapshot directory holds and the
//! binlog offset up to which it is complete. Parse and print are a
//! bijection on valid inputs; rewrite is atomic (write temp, rename).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub offset: u64,
    pub term: u64,
    pub name: String,
    pub count: u64,
}

impl Manifest {
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        writeln!(out, "offset: {}", self.offset).unwrap();
        writeln!(out, "term: {}", self.term).unwrap();
        writeln!(out, "name: {}", self.name).unwrap();
        writeln!(out, "count: {}", self.count).unwrap();
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut manifest = Manifest::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| Error::InvalidData(format!("bad manifest line: {line}")))?;
            match key {
                "offset" => {
                    manifest.offset = value
                        .parse()
                        .map_err(|_| Error::InvalidData(format!("bad offset {value}")))?
                }
                "term" => {
                    manifest.term = value
                        .parse()
                        .map_err(|_| Error::InvalidData(format!("bad term {value}")))?
                }
                "name" => manifest.name = value.to_string(),
                "count" => {
                    manifest.count = value
                        .parse()
                        .map_err(|_| Error::InvalidData(format!("bad count {value}")))?
                }
                other => return Err(Error::InvalidData(format!("unknown manifest key {other}"))),
            }
        }
        Ok(manifest)
    }

    /// Read `MANIFEST` from a snapshot directory; `None` when absent.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(dir.join("MANIFEST")) {
            Ok(text) => Ok(Some(Self::from_text(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e.to_string())),
        }
    }

    /// Atomically replace `MANIFEST` in a snapshot directory.
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join("MANIFEST.tmp");
        fs::write(&tmp, self.to_text())?;
        fs::rename(&tmp, dir.join("MANIFEST"))?;
        Ok(())
    }
}
