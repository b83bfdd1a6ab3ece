//! Chunked file shipping between tablets.
//!
//! The sender streams a file as numbered blocks: block 0 initializes the
//! receiver, data blocks follow in strict sequence, and the final block
//! carries `eof` which renames the staged file into place. Retrying the
//! block the receiver already holds is a no-op; skipping ahead is a
//! `BlockIdMismatch`.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::SendDataRequest;
use crate::error::{Error, Result};
use crate::meta::StorageMode;
use crate::replica::PeerClient;

pub struct FileReceiver {
    file_name: String,
    dir: PathBuf,
    block_id: u64,
    writer: Option<BufWriter<File>>,
    size: u64,
}

impl FileReceiver {
    pub fn new(file_name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            dir: dir.into(),
            block_id: 0,
            writer: None,
            size: 0,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", self.file_name))
    }

    /// Open (or reopen) the staging file. Re-init on a retried block 0
    /// simply starts the transfer over.
    pub fn init(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let file = File::create(self.tmp_path())?;
        self.writer = Some(BufWriter::new(file));
        self.block_id = 0;
        self.size = 0;
        Ok(())
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn write_data(&mut self, block_id: u64, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::InvalidState("receiver is not initialized".to_string()))?;
        writer.write_all(data)?;
        self.block_id = block_id;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Flush and rename the staged file into place.
    pub fn save_file(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let target = self.dir.join(&self.file_name);
        if target.exists() {
            fs::remove_file(&target)?;
        }
        fs::rename(self.tmp_path(), &target)?;
        tracing::info!(file = %self.file_name, size = self.size, "file received");
        Ok(())
    }
}

pub struct FileSender {
    remote_tid: u32,
    pid: u32,
    storage_mode: StorageMode,
    client: Arc<dyn PeerClient>,
    block_size: usize,
}

impl FileSender {
    pub fn new(
        remote_tid: u32,
        pid: u32,
        storage_mode: StorageMode,
        client: Arc<dyn PeerClient>,
        block_size: usize,
    ) -> Self {
        Self { remote_tid, pid, storage_mode, client, block_size }
    }

    fn request(&self, file_name: &str, dir_name: Option<&str>, block_id: u64) -> SendDataRequest {
        SendDataRequest {
            tid: self.remote_tid,
            pid: self.pid,
            file_name: file_name.to_string(),
            block_id,
            block_size: 0,
            eof: false,
            dir_name: dir_name.map(str::to_string),
            storage_mode: Some(self.storage_mode),
        }
    }

    /// Stream one file: an init block, then data blocks, the last with eof.
    pub fn send_file(
        &self,
        file_name: &str,
        path: &PathBuf,
        dir_name: Option<&str>,
    ) -> Result<()> {
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();

        let init = self.request(file_name, dir_name, 0);
        let resp = self.client.send_data(&init, &[])?;
        if !resp.is_ok() {
            return Err(Error::Io(format!("init block rejected: {}", resp.msg)));
        }

        let mut sent = 0u64;
        let mut block_id = 0u64;
        let mut buf = vec![0u8; self.block_size];
        loop {
            let n = file.read(&mut buf)?;
            let eof = sent + n as u64 >= total;
            block_id += 1;
            let mut req = self.request(file_name, dir_name, block_id);
            req.block_size = n as u32;
            req.eof = eof;
            let resp = self.client.send_data(&req, &buf[..n])?;
            if !resp.is_ok() {
                return Err(Error::Io(format!(
                    "block {block_id} of {file_name} rejected: {}",
                    resp.msg
                )));
            }
            sent += n as u64;
            if eof {
                break;
            }
        }
        tracing::info!(file = file_name, bytes = sent, "file sent");
        Ok(())
    }

    /// Stream every regular file of a directory under `dir_name/`.
    pub fn send_dir(&self, dir_name: &str, dir_path: &PathBuf) -> Result<()> {
        for entry in fs::read_dir(dir_path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::InvalidData(format!("bad file name in {dir_path:?}")))?
                .to_string();
            self.send_file(&file_name, &path, Some(dir_name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_sequences_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut receiver = FileReceiver::new("part.sdb", dir.path());
        receiver.init().expect("init failed");
        assert_eq!(receiver.block_id(), 0);

        receiver.write_data(1, b"hello ").expect("write failed");
        receiver.write_data(2, b"world").expect("write failed");
        receiver.save_file().expect("save failed");

        let content = fs::read(dir.path().join("part.sdb")).expect("read failed");
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn test_reinit_restarts_transfer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut receiver = FileReceiver::new("part.sdb", dir.path());
        receiver.init().expect("init failed");
        receiver.write_data(1, b"garbage").expect("write failed");

        receiver.init().expect("reinit failed");
        receiver.write_data(1, b"fresh").expect("write failed");
        receiver.save_file().expect("save failed");

        let content = fs::read(dir.path().join("part.sdb")).expect("read failed");
        assert_eq!(content, b"fresh");
    }

    #[test]
    fn test_save_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("part.sdb"), b"stale").expect("seed failed");
        let mut receiver = FileReceiver::new("part.sdb", dir.path());
        receiver.init().expect("init failed");
        receiver.write_data(1, b"new").expect("write failed");
        receiver.save_file().expect("save failed");
        let content = fs::read(dir.path().join("part.sdb")).expect("read failed");
        assert_eq!(content, b"new");
    }
}
