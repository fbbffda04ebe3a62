use crate::mem::InMemoryStore;
use crate::traits::Storage;
use crate::wal::{self, Manifest, RecBody, WalWriter};
use burrowmq_core::{
    Attributes, FilterCriteria, Message, MessageId, QueueConfig, QueueError, QueueStats, Result,
    TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// One line of a snapshot file.
#[derive(Debug, Serialize, Deserialize)]
pub enum SnapshotRecord {
    Queue(QueueConfig),
    Message(Message),
}

/// In-memory index fronted by a binary WAL. Mutations apply to the index
/// first, then block on the WAL fsync ack, so a success reported to the
/// caller is on disk.
pub struct PersistentStore {
    mem: InMemoryStore,
    wal: WalWriter,
    seq: AtomicU64,
    data_dir: PathBuf,
}

impl PersistentStore {
    pub fn open(data_dir: PathBuf) -> std::io::Result<Self> {
        let wal = WalWriter::open(&data_dir, 256 * 1024 * 1024)?;
        let manifest = wal.manifest();
        let mem = InMemoryStore::new();
        if let Some(snap) = manifest.current_snapshot.as_deref() {
            let path = data_dir.join("snapshots").join(snap);
            match read_snapshot(&path) {
                Ok(recs) => {
                    for r in recs {
                        match r {
                            SnapshotRecord::Queue(cfg) => mem.replay_create_queue(cfg),
                            SnapshotRecord::Message(msg) => mem.replay_insert(msg),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(snapshot = %snap, "snapshot unreadable, replaying wal only: {e}")
                }
            }
        }
        let recs = wal::replay(&data_dir).unwrap_or_default();
        for r in recs {
            match r {
                RecBody::QueueCreate { cfg } => mem.replay_create_queue(cfg),
                RecBody::QueueDelete { tenant, queue } => mem.replay_delete_queue(tenant, &queue),
                RecBody::QueuePurge { tenant, queue } => mem.replay_purge_queue(tenant, &queue),
                RecBody::Insert { msg } => mem.replay_insert(msg),
                RecBody::Claim {
                    tenant,
                    queue,
                    leases,
                } => mem.replay_claim(tenant, &queue, &leases),
                RecBody::Tombstone { tenant, queue, id } => {
                    mem.replay_tombstone(tenant, &queue, id)
                }
            }
        }
        Ok(Self {
            mem,
            wal,
            seq: AtomicU64::new(manifest.last_seq),
            data_dir,
        })
    }

    async fn log(&self, body: RecBody) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.wal
            .append(seq, Utc::now().timestamp(), &body)
            .await
            .map_err(|e| QueueError::Internal(e.to_string()))
    }

    pub fn snapshot(&self) -> std::io::Result<String> {
        let name = format!("snap-{}.zst", ulid::Ulid::new());
        let path = self.data_dir.join("snapshots").join(&name);
        let file = std::fs::File::create(&path)?;
        let mut z = zstd::Encoder::new(file, 3)?;
        for cfg in self.mem.all_queues() {
            write_record(&mut z, &SnapshotRecord::Queue(cfg))?;
        }
        for msg in self.mem.all_messages() {
            write_record(&mut z, &SnapshotRecord::Message(msg))?;
        }
        z.finish()?;
        let bookmark = self.seq.load(Ordering::SeqCst);
        self.wal.update_manifest(&self.data_dir, |m| {
            m.current_snapshot = Some(name.clone());
            m.snapshot_bookmark = Some(bookmark);
        })?;
        Ok(name)
    }
}

fn write_record<W: Write>(w: &mut W, rec: &SnapshotRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(rec)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    w.write_all(line.as_bytes())?;
    w.write_all(b"\n")
}

pub fn read_snapshot(path: &std::path::Path) -> std::io::Result<Vec<SnapshotRecord>> {
    let f = std::fs::File::open(path)?;
    let mut d = zstd::Decoder::new(f)?;
    let mut s = String::new();
    d.read_to_string(&mut s)?;
    let mut out = Vec::new();
    for line in s.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(rec) => out.push(rec),
            Err(e) => {
                tracing::warn!("skipping bad snapshot line: {e}");
            }
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl Storage for PersistentStore {
    async fn create_queue(&self, cfg: QueueConfig) -> Result<()> {
        self.mem.create_queue(cfg.clone()).await?;
        self.log(RecBody::QueueCreate { cfg }).await
    }

    async fn delete_queue(&self, tenant: TenantId, queue: &str) -> Result<()> {
        self.mem.delete_queue(tenant, queue).await?;
        self.log(RecBody::QueueDelete {
            tenant,
            queue: queue.to_string(),
        })
        .await
    }

    async fn purge_queue(&self, tenant: TenantId, queue: &str) -> Result<u64> {
        let removed = self.mem.purge_queue(tenant, queue).await?;
        self.log(RecBody::QueuePurge {
            tenant,
            queue: queue.to_string(),
        })
        .await?;
        Ok(removed)
    }

    async fn list_queues(&self, tenant: TenantId) -> Result<Vec<String>> {
        self.mem.list_queues(tenant).await
    }

    async fn get_queue(&self, tenant: TenantId, queue: &str) -> Result<QueueConfig> {
        self.mem.get_queue(tenant, queue).await
    }

    async fn insert_message(
        &self,
        tenant: TenantId,
        queue: &str,
        body: Vec<u8>,
        attrs: Attributes,
        visible_at: DateTime<Utc>,
        visibility_timeout: u32,
    ) -> Result<MessageId> {
        let id = self
            .mem
            .insert_message(tenant, queue, body, attrs, visible_at, visibility_timeout)
            .await?;
        let msg = self
            .mem
            .peek(tenant, queue, id)
            .await?
            .ok_or_else(|| QueueError::Internal("inserted message vanished".into()))?;
        self.log(RecBody::Insert { msg }).await?;
        Ok(id)
    }

    async fn claim_visible(
        &self,
        tenant: TenantId,
        queue: &str,
        now: DateTime<Utc>,
        visibility_override: Option<u32>,
        max_n: usize,
    ) -> Result<Vec<Message>> {
        let msgs = self
            .mem
            .claim_visible(tenant, queue, now, visibility_override, max_n)
            .await?;
        if !msgs.is_empty() {
            let leases = msgs
                .iter()
                .map(|m| (m.id, m.visible_at.timestamp()))
                .collect();
            self.log(RecBody::Claim {
                tenant,
                queue: queue.to_string(),
                leases,
            })
            .await?;
        }
        Ok(msgs)
    }

    async fn tombstone(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<()> {
        self.mem.tombstone(tenant, queue, id).await?;
        self.log(RecBody::Tombstone {
            tenant,
            queue: queue.to_string(),
            id,
        })
        .await
    }

    async fn peek(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<Option<Message>> {
        self.mem.peek(tenant, queue, id).await
    }

    async fn filter(
        &self,
        tenant: TenantId,
        queue: &str,
        criteria: &FilterCriteria,
    ) -> Result<Vec<MessageId>> {
        self.mem.filter(tenant, queue, criteria).await
    }

    async fn stats(&self, tenant: TenantId, queue: &str) -> Result<QueueStats> {
        self.mem.stats(tenant, queue).await
    }

    async fn admin_snapshot(&self) -> Result<(String, u64)> {
        let id = self
            .snapshot()
            .map_err(|e| QueueError::Internal(e.to_string()))?;
        let last = self.wal.manifest().snapshot_bookmark.unwrap_or(0);
        Ok((id, last))
    }

    async fn admin_manifest(&self) -> Result<serde_json::Value> {
        let m = self.wal.manifest();
        serde_json::to_value(m).map_err(|e| QueueError::Internal(e.to_string()))
    }

    async fn admin_trim_wal(&self, snapshot_id: &str) -> Result<Vec<String>> {
        let manifest = self.wal.manifest();
        if manifest.current_snapshot.as_deref() != Some(snapshot_id) {
            return Err(QueueError::InvalidParameter("snapshot id mismatch".into()));
        }
        let cutoff = manifest.snapshot_bookmark.unwrap_or(0);
        let (deleted, retain) = plan_trim(&manifest, cutoff);
        for name in &deleted {
            let _ = std::fs::remove_file(self.data_dir.join("wal").join(name));
        }
        self.wal
            .update_manifest(&self.data_dir, |m| m.segments = retain)
            .map_err(|e| QueueError::Internal(e.to_string()))?;
        Ok(deleted)
    }
}

// Segments entirely below the bookmark can go, except the newest of them
// which is kept as a safety margin.
fn plan_trim(manifest: &Manifest, cutoff: u64) -> (Vec<String>, Vec<crate::wal::WalSegmentMeta>) {
    let mut last_before_idx: Option<usize> = None;
    for (i, seg) in manifest.segments.iter().enumerate() {
        if seg.max_seq < cutoff {
            last_before_idx = Some(i);
        }
    }
    let mut deleted = Vec::new();
    let mut retain = Vec::new();
    for (i, seg) in manifest.segments.iter().enumerate() {
        if seg.max_seq < cutoff && Some(i) != last_before_idx {
            deleted.push(seg.name.clone());
        } else {
            retain.push(seg.clone());
        }
    }
    (deleted, retain)
}
