//! Metered File Handle — wraps an open file so every read/write accumulates
//! byte counters and emits transfer records into the owning session (spec
//! §4.4).
//!
//! Per the "cyclic references" design note (spec §9), the handle holds an
//! `Arc<Mutex<...>>` to the session's counters/log rather than a
//! back-reference to the whole session; `SessionState` owns the handle's
//! lifetime.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::identity::{Direction, TransferRecord};

/// Which side(s) of a handle are wired to the counters, derived from the
/// SFTP open flags (spec §6 open-flag mapping). Resolves the open
/// question about double-counting: a handle opened read-only never
/// touches the upload counter and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteTruncate,
    WriteAppend,
    ReadWrite,
    ReadWriteAppend,
}

impl AccessMode {
    pub fn meters_reads(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite | AccessMode::ReadWriteAppend)
    }

    pub fn meters_writes(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Shared per-session counters and transfer log, behind a single async
/// mutex. Cheap because spec §5 only requires correctness under a single
/// scheduling unit per session; the mutex exists so a future parallel-verb
/// dispatcher would still be correct (spec §9 "counter accumulation").
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub transfers: Vec<TransferRecord>,
}

pub type SharedCounters = Arc<AsyncMutex<Counters>>;

/// Wraps a `tokio::fs::File`, metering reads/writes against the owning
/// session's [`Counters`].
pub struct MeteredFileHandle {
    file: tokio::fs::File,
    mode: AccessMode,
    /// Canonicalized virtual path at open time, recorded on every
    /// transfer — never the host path.
    virtual_path: String,
    connection_id: Uuid,
    username: String,
    counters: SharedCounters,
    closed: bool,
}

impl MeteredFileHandle {
    pub fn new(
        file: tokio::fs::File,
        mode: AccessMode,
        virtual_path: String,
        connection_id: Uuid,
        username: String,
        counters: SharedCounters,
    ) -> Self {
        Self {
            file,
            mode,
            virtual_path,
            connection_id,
            username,
            counters,
            closed: false,
        }
    }

    /// Reads up to `len` bytes at `offset`. A zero-length result emits no
    /// transfer record.
    pub async fn read_at(&mut self, offset: u64, len: u32) -> std::io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        loop {
            let n = self.file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);

        if total > 0 && self.mode.meters_reads() {
            self.emit(Direction::Download, total as u64).await;
        }
        Ok(buf)
    }

    /// Writes `data` at `offset`. A zero-length write emits no transfer
    /// record.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;

        if !data.is_empty() && self.mode.meters_writes() {
            self.emit(Direction::Upload, data.len() as u64).await;
        }
        Ok(())
    }

    async fn emit(&self, direction: Direction, size: u64) {
        let record = TransferRecord {
            connection_id: self.connection_id,
            username: self.username.clone(),
            path: self.virtual_path.clone(),
            direction,
            size,
            timestamp: Utc::now(),
        };
        let mut counters = self.counters.lock().await;
        match direction {
            Direction::Upload => counters.bytes_uploaded += size,
            Direction::Download => counters.bytes_downloaded += size,
        }
        counters.transfers.push(record);
    }

    pub async fn sync_all(&self) -> std::io::Result<()> {
        self.file.sync_all().await
    }

    pub async fn set_len(&self, size: u64) -> std::io::Result<()> {
        self.file.set_len(size).await
    }

    pub async fn metadata(&self) -> std::io::Result<std::fs::Metadata> {
        self.file.metadata().await
    }

    /// Idempotent; closing twice never emits and never errors.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
