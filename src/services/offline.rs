//! Durable offline queue for transactions recorded while the central
//! store is unreachable
//!
//! The journal is append-only JSONL: one entry per line, records and
//! sync marks interleaved in the order they happened. Startup replays the
//! whole file to rebuild state; a corrupt tail (torn write on power loss)
//! costs only the corrupt lines, never the file. Replay to the central
//! store is strictly ordered by sequence number and stops at the first
//! failure, so a record is never pushed before its predecessors.

use crate::infra::config::Config;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::types::epoch_ms;

/// One queued transaction. The payload is opaque to the queue; ordering
/// and identity are the queue's concern, meaning is the store's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub id: Uuid,
    pub seq: u64,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
    #[serde(default)]
    pub synced_at_ms: Option<u64>,
}

/// Journal line vocabulary
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Record {
        #[serde(flatten)]
        record: OfflineRecord,
    },
    Synced {
        id: Uuid,
        ts_ms: u64,
    },
}

struct Inner {
    file: File,
    /// Seq-ordered; BTreeMap iteration IS the replay order
    records: BTreeMap<u64, OfflineRecord>,
    by_id: FxHashMap<Uuid, u64>,
    next_seq: u64,
}

pub struct OfflineQueue {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl OfflineQueue {
    /// Open (or create) the journal and rebuild in-memory state from it.
    /// Unparseable lines are counted and skipped; everything before them
    /// survives.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let mut records: BTreeMap<u64, OfflineRecord> = BTreeMap::new();
        let mut by_id: FxHashMap<Uuid, u64> = FxHashMap::default();
        let mut next_seq: u64 = 1;
        let mut corrupt = 0usize;

        if path.exists() {
            let reader = BufReader::new(
                File::open(&path)
                    .with_context(|| format!("Failed to open journal {}", path.display()))?,
            );
            for line in reader.lines() {
                let line = line.with_context(|| "Failed reading journal line")?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(JournalEntry::Record { record }) => {
                        next_seq = next_seq.max(record.seq + 1);
                        by_id.insert(record.id, record.seq);
                        records.insert(record.seq, record);
                    }
                    Ok(JournalEntry::Synced { id, ts_ms }) => {
                        if let Some(&seq) = by_id.get(&id) {
                            if let Some(record) = records.get_mut(&seq) {
                                record.synced_at_ms = Some(ts_ms);
                            }
                        }
                    }
                    Err(e) => {
                        corrupt += 1;
                        warn!(error = %e, "journal_line_corrupt_skipped");
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {} for append", path.display()))?;

        info!(
            path = %path.display(),
            records = %records.len(),
            pending = %records.values().filter(|r| r.synced_at_ms.is_none()).count(),
            corrupt_lines = %corrupt,
            "offline_queue_opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, records, by_id, next_seq }),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(config.offline_journal())
    }

    fn append(inner: &mut Inner, entry: &JournalEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry).context("Failed to encode journal entry")?;
        line.push('\n');
        inner.file.write_all(line.as_bytes()).context("Failed to append journal entry")?;
        // The journal is the last line of defense while the store is down;
        // the entry must be on disk before the caller is told it is queued
        inner.file.sync_data().context("Failed to sync journal")?;
        Ok(())
    }

    /// Durably record one transaction. Returns only after the journal
    /// entry has hit disk.
    pub fn enqueue(&self, payload: serde_json::Value) -> anyhow::Result<OfflineRecord> {
        let mut inner = self.inner.lock();
        let record = OfflineRecord {
            id: Uuid::now_v7(),
            seq: inner.next_seq,
            payload,
            created_at_ms: epoch_ms(),
            synced_at_ms: None,
        };
        Self::append(&mut inner, &JournalEntry::Record { record: record.clone() })?;
        inner.next_seq += 1;
        inner.by_id.insert(record.id, record.seq);
        inner.records.insert(record.seq, record.clone());
        info!(id = %record.id, seq = %record.seq, "offline_record_queued");
        Ok(record)
    }

    /// All unsynced records in strict sequence order
    pub fn pending(&self) -> Vec<OfflineRecord> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.synced_at_ms.is_none())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.synced_at_ms.is_none())
            .count()
    }

    /// Mark a record as delivered to the central store. Idempotent: a
    /// second call for the same id is a no-op, and unknown ids return
    /// false without touching the journal.
    pub fn mark_synced(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let Some(&seq) = inner.by_id.get(&id) else {
            return Ok(false);
        };
        if inner.records.get(&seq).and_then(|r| r.synced_at_ms).is_some() {
            return Ok(true);
        }
        let ts_ms = epoch_ms();
        Self::append(&mut inner, &JournalEntry::Synced { id, ts_ms })?;
        if let Some(record) = inner.records.get_mut(&seq) {
            record.synced_at_ms = Some(ts_ms);
        }
        info!(id = %id, seq = %seq, "offline_record_synced");
        Ok(true)
    }

    /// Compact the journal: drop synced records older than the retention
    /// window and rewrite the rest as a fresh file, atomically via rename.
    pub fn gc(&self, retention: Duration) -> anyhow::Result<usize> {
        let cutoff = epoch_ms().saturating_sub(retention.as_millis() as u64);
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let before = inner.records.len();
        inner.records.retain(|_, r| match r.synced_at_ms {
            Some(synced) => synced >= cutoff,
            None => true,
        });
        inner.by_id = inner.records.values().map(|r| (r.id, r.seq)).collect();
        let dropped = before - inner.records.len();

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            for record in inner.records.values() {
                let mut line =
                    serde_json::to_string(&JournalEntry::Record { record: record.clone() })?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace journal {}", self.path.display()))?;

        inner.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reopen journal {}", self.path.display()))?;

        info!(dropped = %dropped, kept = %inner.records.len(), "offline_journal_compacted");
        Ok(dropped)
    }
}

/// Delivery seam to the central store, so replay logic is testable
/// without a network.
#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn push(&self, record: &OfflineRecord) -> anyhow::Result<()>;
}

/// Line-oriented TCP sink: one JSON record per line, "OK" reply per record.
pub struct TcpSyncSink {
    addr: String,
    timeout: Duration,
}

impl TcpSyncSink {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self { addr: addr.into(), timeout }
    }
}

#[async_trait]
impl SyncSink for TcpSyncSink {
    async fn push(&self, record: &OfflineRecord) -> anyhow::Result<()> {
        let fut = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("Failed to connect to store {}", self.addr))?;
            let (read_half, mut write_half) = stream.into_split();

            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            write_half.write_all(line.as_bytes()).await.context("Failed to send record")?;

            let mut reply = String::new();
            AsyncBufReader::new(read_half)
                .read_line(&mut reply)
                .await
                .context("Failed to read store reply")?;
            if reply.trim() != "OK" {
                anyhow::bail!("store rejected record: {}", reply.trim());
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("store push timed out"))?
    }
}

/// Periodic replay of pending records to the central store
pub struct OfflineReplayer {
    queue: Arc<OfflineQueue>,
    sink: Box<dyn SyncSink>,
    interval: Duration,
    retention: Duration,
}

impl OfflineReplayer {
    pub fn new(
        queue: Arc<OfflineQueue>,
        sink: Box<dyn SyncSink>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            sink,
            interval: config.replay_interval(),
            retention: config.offline_retention(),
        }
    }

    /// Push pending records in sequence order. Stops at the first failure:
    /// later records must never reach the store before earlier ones.
    pub async fn replay_once(&self) -> usize {
        let pending = self.queue.pending();
        let mut replayed = 0;
        for record in pending {
            match self.sink.push(&record).await {
                Ok(()) => {
                    if let Err(e) = self.queue.mark_synced(record.id) {
                        warn!(id = %record.id, error = %e, "offline_sync_mark_failed");
                        break;
                    }
                    replayed += 1;
                }
                Err(e) => {
                    warn!(id = %record.id, seq = %record.seq, error = %e, "offline_replay_stopped");
                    break;
                }
            }
        }
        if replayed > 0 {
            info!(replayed = %replayed, remaining = %self.queue.pending_count(), "offline_replayed");
        }
        replayed
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = %self.interval.as_secs(), "offline_replayer_started");
        let mut timer = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("offline_replayer_shutdown");
                        return;
                    }
                }
                _ = timer.tick() => {}
            }

            self.replay_once().await;
            if let Err(e) = self.queue.gc(self.retention) {
                warn!(error = %e, "offline_gc_failed");
            }
        }
    }
}
