//! Iterator interfaces over time-indexed entries.
//!
//! Entries under a fixed `(index, key, ts column)` are ordered by `ts`
//! descending, newest first; `seek_to_first` lands on the newest entry and
//! `next` moves toward older ones. Implementations are stateless cursors:
//! each step issues a fresh bounded range query against the backing skip
//! map, so a cursor stays usable while writers insert and GC unlinks.

use serde::{Deserialize, Serialize};

/// Comparison mode for seek and range bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekType {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
}

/// Cursor over the entries of a single key.
pub trait TsIterator {
    /// Position on the newest entry.
    fn seek_to_first(&mut self);

    /// Position on the first entry with `ts <= target` (entries are newest
    /// first, so this skips everything newer than `target`).
    fn seek(&mut self, ts: u64);

    /// Move one entry toward older timestamps.
    fn next(&mut self);

    fn valid(&self) -> bool;

    /// Timestamp of the current entry.
    fn ts(&self) -> u64;

    /// Payload of the current entry.
    fn value(&self) -> &[u8];
}

/// Cursor across all keys of one index, yielding each key's entries
/// newest-first before moving to the next key.
pub trait TraverseIterator {
    fn seek_to_first(&mut self);

    /// Resume after `(pk, ts)`: within `pk`, land on the first entry with
    /// `ts` strictly older than `ts`; when the key is exhausted, move on to
    /// the next key.
    fn seek(&mut self, pk: &str, ts: u64);

    fn next(&mut self);

    fn valid(&self) -> bool;

    fn pk(&self) -> &str;

    fn ts(&self) -> u64;

    fn value(&self) -> &[u8];

    /// Total entries stepped over so far, including expired ones that were
    /// skipped. Used to bound a single traverse call.
    fn steps(&self) -> u64;
}
