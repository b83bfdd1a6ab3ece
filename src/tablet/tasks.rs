//! Background ticks for the tablet runtime, registered on the scheduler.
//!
//! Each task owns one pool concern: GC, binlog fsync, binlog truncation,
//! the nightly snapshot window, periodic disk-table snapshots, recycle-bin
//! sweeps and disk-used sampling.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context, Scheduler};
use crate::tablet::TabletServer;

pub fn register_all(server: &Arc<TabletServer>, scheduler: &Arc<Scheduler>) {
    scheduler
        .register(Arc::new(GcTask { server: server.clone(), disk: false }))
        .register(Arc::new(GcTask { server: server.clone(), disk: true }))
        .register(Arc::new(SyncDiskTask { server: server.clone() }))
        .register(Arc::new(DelBinlogTask { server: server.clone() }))
        .register(Arc::new(SnapshotCheckTask { server: server.clone() }))
        .register(Arc::new(DiskSnapshotTask { server: server.clone() }))
        .register(Arc::new(RecycleSweepTask { server: server.clone() }))
        .register(Arc::new(DiskusedTask { server: server.clone() }));
}

struct GcTask {
    server: Arc<TabletServer>,
    disk: bool,
}

#[async_trait::async_trait]
impl BackgroundTask for GcTask {
    fn name(&self) -> &'static str {
        if self.disk {
            "disk-gc"
        } else {
            "gc"
        }
    }

    fn interval(&self) -> Duration {
        let minutes = if self.disk {
            self.server.config().disk_gc_interval
        } else {
            self.server.config().gc_interval
        };
        Duration::from_secs(minutes * 60)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        let disk = self.disk;
        tokio::task::spawn_blocking(move || server.gc_tick(disk)).await?;
        Ok(())
    }
}

struct SyncDiskTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for SyncDiskTask {
    fn name(&self) -> &'static str {
        "binlog-sync"
    }

    fn interval(&self) -> Duration {
        self.server.config().binlog_sync_to_disk_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.sync_disk_tick()).await?;
        Ok(())
    }
}

struct DelBinlogTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for DelBinlogTask {
    fn name(&self) -> &'static str {
        "binlog-delete"
    }

    fn interval(&self) -> Duration {
        self.server.config().binlog_delete_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.delete_binlog_tick()).await?;
        Ok(())
    }
}

struct SnapshotCheckTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for SnapshotCheckTask {
    fn name(&self) -> &'static str {
        "snapshot-check"
    }

    fn interval(&self) -> Duration {
        self.server.config().make_snapshot_check_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.snapshot_check_tick()).await?;
        Ok(())
    }
}

struct DiskSnapshotTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for DiskSnapshotTask {
    fn name(&self) -> &'static str {
        "disk-snapshot"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.server.config().make_disktable_snapshot_interval * 60)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.disk_snapshot_tick()).await?;
        Ok(())
    }
}

struct RecycleSweepTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for RecycleSweepTask {
    fn name(&self) -> &'static str {
        "recycle-sweep"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.server.config().recycle_ttl * 60)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.recycle_sweep_tick()).await?;
        Ok(())
    }
}

struct DiskusedTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for DiskusedTask {
    fn name(&self) -> &'static str {
        "diskused"
    }

    fn interval(&self) -> Duration {
        self.server.config().get_table_diskused_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.diskused_tick()).await?;
        Ok(())
    }
}
