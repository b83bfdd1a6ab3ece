//! Follower catch-up workers.
//!
//! One worker thread per follower tails the leader's LogPart in bounded
//! batches and pushes them over the peer connection. Workers hold only a
//! weak handle to the replicator so a dropped partition is not kept alive
//! by its syncers; cancellation is a cooperative check between batches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api::AppendEntriesRequest;
use crate::error::Result;
use crate::replica::peer::PeerClient;
use crate::replica::Replicator;

/// Entries per AppendEntries batch.
const BATCH_SIZE: usize = 256;

/// Poll cadence when caught up or after a send failure.
const IDLE_WAIT: Duration = Duration::from_millis(100);

pub struct Syncer {
    endpoint: String,
    remote_tid: u32,
    pid: u32,
    client: RwLock<Arc<dyn PeerClient>>,
    synced_offset: AtomicU64,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Syncer {
    pub fn spawn(
        replicator: &Arc<Replicator>,
        endpoint: String,
        remote_tid: u32,
    ) -> Result<Arc<Self>> {
        let client = replicator.connector().connect(&endpoint)?;
        let syncer = Arc::new(Self {
            endpoint: endpoint.clone(),
            remote_tid,
            pid: replicator.pid(),
            client: RwLock::new(client),
            synced_offset: AtomicU64::new(0),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
        });
        let weak = Arc::downgrade(replicator);
        let worker = syncer.clone();
        let handle = std::thread::Builder::new()
            .name(format!("syncer-{endpoint}"))
            .spawn(move || worker.run(weak))
            .map_err(|e| crate::Error::Io(e.to_string()))?;
        *syncer.handle.lock()? = Some(handle);
        Ok(syncer)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn synced_offset(&self) -> u64 {
        self.synced_offset.load(Ordering::SeqCst)
    }

    /// Replace the peer connection; in-flight batches finish on the old one.
    pub fn reset_client(&self, client: Arc<dyn PeerClient>) {
        *self.client.write().unwrap() = client;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }

    fn run(&self, replicator: Weak<Replicator>) {
        tracing::info!(endpoint = %self.endpoint, "syncer started");
        while self.running.load(Ordering::SeqCst) {
            let Some(rep) = replicator.upgrade() else { break };
            let synced = self.synced_offset();
            if rep.offset() <= synced {
                drop(rep);
                std::thread::sleep(IDLE_WAIT);
                continue;
            }

            let (pre_log_index, pre_log_term, entries) = match rep.batch_from(synced, BATCH_SIZE) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "failed to read batch");
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                }
            };
            if entries.is_empty() {
                std::thread::sleep(IDLE_WAIT);
                continue;
            }

            let req = AppendEntriesRequest {
                tid: self.remote_tid,
                pid: self.pid,
                pre_log_index,
                pre_log_term,
                term: rep.term(),
                entries,
            };
            let client = self.client.read().unwrap().clone();
            drop(rep);
            match client.append_entries(&req) {
                Ok(resp) if resp.code.is_ok() => {
                    self.synced_offset.store(resp.log_offset, Ordering::SeqCst);
                }
                Ok(resp) => {
                    // Prefix mismatch; back up to the follower's tail.
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        follower_offset = resp.log_offset,
                        "append rejected, backing up"
                    );
                    self.synced_offset.store(resp.log_offset, Ordering::SeqCst);
                    std::thread::sleep(IDLE_WAIT);
                }
                Err(e) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "append entries failed");
                    std::thread::sleep(IDLE_WAIT);
                }
            }
        }
        tracing::info!(endpoint = %self.endpoint, "syncer stopped");
    }
}
