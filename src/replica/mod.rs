//! Log replication: binds one table to one LogPart under a role.
//!
//! The leader assigns dense offsets, appends to the LogPart and ships
//! batches to follower syncers. A follower accepts a batch only when the
//! `(pre_log_index, pre_log_term)` pair matches its own tail, otherwise it
//! answers with its current offset so the leader backs up and retries.
//! Partial failures are never rolled back; binlog catch-up reconciles them.

pub mod peer;
pub mod syncer;

pub use peer::{NullConnector, PeerClient, PeerConnector};
pub use syncer::Syncer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::api::{AppendEntriesRequest, AppendEntriesResponse};
use crate::binlog::{LogEntry, LogPart};
use crate::codes::ReturnCode;
use crate::error::{Error, Result};
use crate::storage::TsTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Outcome of adding a replicate node; duplicates are distinguished from
/// failures so callers can answer with different codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddNode {
    Added,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelNode {
    Removed,
    NotFound,
}

pub struct Replicator {
    tid: u32,
    pid: u32,
    table: Arc<TsTable>,
    log_part: Arc<LogPart>,
    role: RwLock<Role>,
    offset: AtomicU64,
    last_log_term: AtomicU64,
    term: AtomicU64,
    snapshot_log_index: AtomicU64,
    syncers: Mutex<Vec<Arc<Syncer>>>,
    connector: Arc<dyn PeerConnector>,
    /// Serializes offset assignment with the log append behind it.
    append_mu: Mutex<()>,
}

impl Replicator {
    pub fn new(
        tid: u32,
        pid: u32,
        table: Arc<TsTable>,
        log_part: Arc<LogPart>,
        role: Role,
        term: u64,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            tid,
            pid,
            table,
            log_part,
            role: RwLock::new(role),
            offset: AtomicU64::new(0),
            last_log_term: AtomicU64::new(0),
            term: AtomicU64::new(term),
            snapshot_log_index: AtomicU64::new(0),
            syncers: Mutex::new(Vec::new()),
            connector,
            append_mu: Mutex::new(()),
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Seed the offset after recovery; also aligns the tail term.
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::SeqCst);
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term.load(Ordering::SeqCst)
    }

    pub fn snapshot_log_index(&self) -> u64 {
        self.snapshot_log_index.load(Ordering::SeqCst)
    }

    /// Called after a successful snapshot so binlog truncation may retire
    /// segments up to `offset`.
    pub fn set_snapshot_log_index(&self, offset: u64) {
        self.snapshot_log_index.store(offset, Ordering::SeqCst);
    }

    pub fn log_part(&self) -> &Arc<LogPart> {
        &self.log_part
    }

    pub(crate) fn connector(&self) -> &Arc<dyn PeerConnector> {
        &self.connector
    }

    /// Leader write path: stamp offset and term, append to the LogPart.
    /// The table apply happens at the caller so follower application and
    /// leader writes share one code path.
    pub fn append_entry(&self, entry: &mut LogEntry) -> Result<u64> {
        if !self.is_leader() {
            return Err(Error::InvalidState("replicator is not leader".to_string()));
        }
        let _guard = self.append_mu.lock()?;
        let offset = self.offset.load(Ordering::SeqCst) + 1;
        entry.offset = offset;
        entry.term = self.term();
        self.log_part.append(entry)?;
        self.offset.store(offset, Ordering::SeqCst);
        self.last_log_term.store(entry.term, Ordering::SeqCst);
        Ok(offset)
    }

    /// Follower ingest path: offset-strict append + apply.
    pub fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        if self.is_leader() {
            return Err(Error::InvalidState("replicator is leader".to_string()));
        }
        let _guard = self.append_mu.lock()?;
        let cur = self.offset();
        if req.pre_log_index != cur
            || (req.pre_log_index > 0 && req.pre_log_term != self.last_log_term())
        {
            tracing::debug!(
                tid = self.tid,
                pid = self.pid,
                pre_log_index = req.pre_log_index,
                offset = cur,
                "rejecting append entries, prefix mismatch"
            );
            return Ok(AppendEntriesResponse {
                code: ReturnCode::FailToAppendEntriesToReplicator,
                msg: "prefix mismatch".to_string(),
                log_offset: cur,
            });
        }
        for entry in &req.entries {
            let cur = self.offset();
            if entry.offset <= cur {
                continue;
            }
            if entry.offset != cur + 1 {
                break;
            }
            self.log_part.append(entry)?;
            self.table.apply_entry(entry)?;
            self.offset.store(entry.offset, Ordering::SeqCst);
            self.last_log_term.store(entry.term, Ordering::SeqCst);
        }
        self.term.store(req.term, Ordering::SeqCst);
        Ok(AppendEntriesResponse {
            code: ReturnCode::Ok,
            msg: "ok".to_string(),
            log_offset: self.offset(),
        })
    }

    /// Read the batch after `synced` together with its prefix-check pair.
    pub(crate) fn batch_from(
        &self,
        synced: u64,
        max: usize,
    ) -> Result<(u64, u64, Vec<LogEntry>)> {
        let mut pre_log_term = 0u64;
        let mut entries = Vec::new();
        if synced == 0 {
            for entry in self.log_part.reader(1)? {
                entries.push(entry?);
                if entries.len() >= max {
                    break;
                }
            }
        } else {
            let mut reader = self.log_part.reader(synced)?;
            match reader.next() {
                Some(entry) => {
                    let entry = entry?;
                    if entry.offset != synced {
                        // The prefix entry was truncated away; this follower
                        // needs a snapshot ship, not a log replay.
                        tracing::warn!(
                            tid = self.tid,
                            pid = self.pid,
                            synced,
                            first_available = entry.offset,
                            "follower offset below retained log"
                        );
                        return Ok((synced, 0, Vec::new()));
                    }
                    pre_log_term = entry.term;
                }
                None => return Ok((synced, 0, Vec::new())),
            }
            for entry in reader {
                entries.push(entry?);
                if entries.len() >= max {
                    break;
                }
            }
        }
        Ok((synced, pre_log_term, entries))
    }

    /// Start a syncer for a follower. Duplicate endpoints are reported, not
    /// failed, so the caller can answer `kReplicaEndpointAlreadyExists`.
    pub fn add_replicate_node(
        self: &Arc<Self>,
        endpoint: &str,
        remote_tid: Option<u32>,
    ) -> Result<AddNode> {
        if !self.is_leader() {
            return Err(Error::InvalidState("replicator is not leader".to_string()));
        }
        let mut syncers = self.syncers.lock()?;
        if syncers.iter().any(|s| s.endpoint() == endpoint) {
            return Ok(AddNode::AlreadyExists);
        }
        let syncer = Syncer::spawn(self, endpoint.to_string(), remote_tid.unwrap_or(self.tid))?;
        syncers.push(syncer);
        tracing::info!(tid = self.tid, pid = self.pid, endpoint, "added replicate node");
        Ok(AddNode::Added)
    }

    pub fn del_replicate_node(&self, endpoint: &str) -> Result<DelNode> {
        if !self.is_leader() {
            return Err(Error::InvalidState("replicator is not leader".to_string()));
        }
        let syncer = {
            let mut syncers = self.syncers.lock()?;
            match syncers.iter().position(|s| s.endpoint() == endpoint) {
                Some(pos) => syncers.remove(pos),
                None => return Ok(DelNode::NotFound),
            }
        };
        syncer.stop();
        tracing::info!(tid = self.tid, pid = self.pid, endpoint, "removed replicate node");
        Ok(DelNode::Removed)
    }

    pub fn del_all_replicate_node(&self) {
        let drained: Vec<Arc<Syncer>> = {
            let mut syncers = self.syncers.lock().unwrap();
            syncers.drain(..).collect()
        };
        for syncer in drained {
            syncer.stop();
        }
    }

    pub fn get_replicate_info(&self) -> Vec<(String, u64)> {
        self.syncers
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.endpoint().to_string(), s.synced_offset()))
            .collect()
    }

    /// Role change. Switching to follower drops every syncer; switching to
    /// leader takes the caller-supplied term.
    pub fn set_role(&self, role: Role, term: u64) {
        match role {
            Role::Leader => {
                *self.role.write().unwrap() = Role::Leader;
                self.set_term(term);
            }
            Role::Follower => {
                self.del_all_replicate_node();
                *self.role.write().unwrap() = Role::Follower;
            }
        }
    }

    /// Retire binlog segments every live consumer has passed: the snapshot
    /// and every follower cursor bound the cut.
    pub fn sched_delete_binlog(&self) -> Result<usize> {
        let snapshot_offset = self.snapshot_log_index();
        if snapshot_offset == 0 {
            return Ok(0);
        }
        let mut bound = snapshot_offset;
        for syncer in self.syncers.lock()?.iter() {
            bound = bound.min(syncer.synced_offset() + 1);
        }
        self.log_part.truncate_before(bound)
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.del_all_replicate_node();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GeneralResponse, SendDataRequest};
    use crate::meta::TableMeta;
    use crate::storage::mem_table::MemTable;
    use std::path::Path;

    fn make_table() -> Arc<TsTable> {
        Arc::new(TsTable::Mem(MemTable::new(TableMeta::new("t1", 1, 0)).unwrap()))
    }

    fn make_replicator(dir: &Path, role: Role, connector: Arc<dyn PeerConnector>) -> Arc<Replicator> {
        let log = Arc::new(LogPart::open(dir.join("binlog"), 1024 * 1024).unwrap());
        Arc::new(Replicator::new(1, 0, make_table(), log, role, 1, connector))
    }

    /// Routes append_entries straight into a follower replicator.
    struct Loopback {
        follower: Arc<Replicator>,
    }

    impl PeerClient for Loopback {
        fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            self.follower.append_entries(req)
        }

        fn send_data(&self, _req: &SendDataRequest, _data: &[u8]) -> Result<GeneralResponse> {
            errinput!("not a file peer")
        }
    }

    struct LoopbackConnector {
        follower: Arc<Replicator>,
    }

    impl PeerConnector for LoopbackConnector {
        fn connect(&self, _endpoint: &str) -> Result<Arc<dyn PeerClient>> {
            Ok(Arc::new(Loopback { follower: self.follower.clone() }))
        }
    }

    #[test]
    fn test_leader_assigns_dense_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rep = make_replicator(dir.path(), Role::Leader, Arc::new(NullConnector));
        for i in 1..=5u64 {
            let mut entry = LogEntry::put("k", i * 100, b"v".to_vec());
            assert_eq!(rep.append_entry(&mut entry).unwrap(), i);
            assert_eq!(entry.term, 1);
        }
        assert_eq!(rep.offset(), 5);
    }

    #[test]
    fn test_follower_rejects_leader_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rep = make_replicator(dir.path(), Role::Follower, Arc::new(NullConnector));
        let mut entry = LogEntry::put("k", 100, b"v".to_vec());
        assert!(rep.append_entry(&mut entry).is_err());
    }

    #[test]
    fn test_append_entries_offset_strict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = make_replicator(dir.path(), Role::Follower, Arc::new(NullConnector));

        let mut e1 = LogEntry::put("k", 100, b"v1".to_vec());
        e1.offset = 1;
        e1.term = 1;
        let ok = follower
            .append_entries(&AppendEntriesRequest {
                tid: 1,
                pid: 0,
                pre_log_index: 0,
                pre_log_term: 0,
                term: 1,
                entries: vec![e1],
            })
            .unwrap();
        assert!(ok.code.is_ok());
        assert_eq!(ok.log_offset, 1);

        // A gap is rejected with the current offset.
        let mut e3 = LogEntry::put("k", 300, b"v3".to_vec());
        e3.offset = 3;
        e3.term = 1;
        let rejected = follower
            .append_entries(&AppendEntriesRequest {
                tid: 1,
                pid: 0,
                pre_log_index: 2,
                pre_log_term: 1,
                term: 1,
                entries: vec![e3],
            })
            .unwrap();
        assert_eq!(rejected.code, ReturnCode::FailToAppendEntriesToReplicator);
        assert_eq!(rejected.log_offset, 1);
    }

    #[test]
    fn test_append_entries_duplicate_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = make_replicator(dir.path(), Role::Follower, Arc::new(NullConnector));
        let mut e1 = LogEntry::put("k", 100, b"v1".to_vec());
        e1.offset = 1;
        e1.term = 1;
        let req = AppendEntriesRequest {
            tid: 1,
            pid: 0,
            pre_log_index: 0,
            pre_log_term: 0,
            term: 1,
            entries: vec![e1.clone()],
        };
        assert!(follower.append_entries(&req).unwrap().code.is_ok());
        // Same prefix again: the duplicate entry is skipped, offset holds.
        let mut e2 = LogEntry::put("k", 200, b"v2".to_vec());
        e2.offset = 2;
        e2.term = 1;
        let resp = follower
            .append_entries(&AppendEntriesRequest {
                tid: 1,
                pid: 0,
                pre_log_index: 1,
                pre_log_term: 1,
                term: 1,
                entries: vec![e1, e2],
            })
            .unwrap();
        assert!(resp.code.is_ok());
        assert_eq!(resp.log_offset, 2);
    }

    #[test]
    fn test_syncer_catches_follower_up() {
        let leader_dir = tempfile::tempdir().expect("tempdir");
        let follower_dir = tempfile::tempdir().expect("tempdir");
        let follower = make_replicator(follower_dir.path(), Role::Follower, Arc::new(NullConnector));
        let connector = Arc::new(LoopbackConnector { follower: follower.clone() });
        let leader = make_replicator(leader_dir.path(), Role::Leader, connector);

        for i in 1..=10u64 {
            let mut entry = LogEntry::put("k", i * 100, format!("v{i}").into_bytes());
            leader.append_entry(&mut entry).unwrap();
        }
        assert_eq!(leader.add_replicate_node("peer:1", None).unwrap(), AddNode::Added);
        assert_eq!(
            leader.add_replicate_node("peer:1", None).unwrap(),
            AddNode::AlreadyExists
        );

        // Wait for catch-up.
        for _ in 0..100 {
            if follower.offset() == 10 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(follower.offset(), 10);
        let info = leader.get_replicate_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].1, 10);

        leader.del_all_replicate_node();
    }

    #[test]
    fn test_set_role_to_follower_drops_syncers() {
        let leader_dir = tempfile::tempdir().expect("tempdir");
        let follower_dir = tempfile::tempdir().expect("tempdir");
        let follower = make_replicator(follower_dir.path(), Role::Follower, Arc::new(NullConnector));
        let connector = Arc::new(LoopbackConnector { follower });
        let leader = make_replicator(leader_dir.path(), Role::Leader, connector);
        leader.add_replicate_node("peer:1", None).unwrap();

        leader.set_role(Role::Follower, 0);
        assert!(leader.get_replicate_info().is_empty());
        assert!(!leader.is_leader());

        leader.set_role(Role::Leader, 42);
        assert_eq!(leader.term(), 42);
    }

    #[test]
    fn test_sched_delete_binlog_respects_followers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(LogPart::open(dir.path().join("binlog"), 64).unwrap());
        let rep = Arc::new(Replicator::new(
            1,
            0,
            make_table(),
            log.clone(),
            Role::Leader,
            1,
            Arc::new(NullConnector),
        ));
        for i in 1..=20u64 {
            let mut entry = LogEntry::put("k", i * 100, b"value-bytes".to_vec());
            rep.append_entry(&mut entry).unwrap();
        }
        // Nothing is deleted before a snapshot exists.
        assert_eq!(rep.sched_delete_binlog().unwrap(), 0);

        rep.set_snapshot_log_index(20);
        assert!(rep.sched_delete_binlog().unwrap() > 0);
        // The tail stays readable.
        let offsets: Vec<u64> = log
            .reader(20)
            .unwrap()
            .map(|e| e.unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![20]);
    }
}
