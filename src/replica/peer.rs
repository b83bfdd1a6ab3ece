//! Interfaces to remote tablets.
//!
//! The remote-call framework lives outside this crate; replication and file
//! shipping only need these two traits. Connections are swapped atomically
//! behind a lock so routing updates never stall readers.

use std::sync::Arc;

use crate::api::{AppendEntriesRequest, AppendEntriesResponse, GeneralResponse, SendDataRequest};
use crate::error::Result;

pub trait PeerClient: Send + Sync {
    fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Ship one chunk of a file; `data` is the block payload.
    fn send_data(&self, req: &SendDataRequest, data: &[u8]) -> Result<GeneralResponse>;
}

pub trait PeerConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerClient>>;
}

/// Connector for nodes running without peers; every connect fails.
pub struct NullConnector;

impl PeerConnector for NullConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerClient>> {
        errinput!("no route to endpoint {endpoint}")
    }
}
