use burrowmq_core::{Message, MessageId, QueueConfig, TenantId};
use ciborium::ser;
use crc32c::crc32c;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{Histogram, HistogramOpts, IntCounter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use tokio::sync::{mpsc, oneshot};

const MAGIC: [u8; 4] = *b"BMQW";
const VER: u8 = 1;
const HDR_LEN: usize = 4 + 1 + 1 + 8 + 8 + 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RecType {
    QueueCreate = 1,
    QueueDelete = 2,
    QueuePurge = 3,
    Insert = 4,
    Claim = 5,
    Tombstone = 6,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RecBody {
    QueueCreate {
        cfg: QueueConfig,
    },
    QueueDelete {
        tenant: TenantId,
        queue: String,
    },
    QueuePurge {
        tenant: TenantId,
        queue: String,
    },
    Insert {
        msg: Message,
    },
    Claim {
        tenant: TenantId,
        queue: String,
        // (message id, lease expiry as unix seconds)
        leases: Vec<(MessageId, i64)>,
    },
    Tombstone {
        tenant: TenantId,
        queue: String,
        id: MessageId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WalSegmentMeta {
    pub name: String,
    pub max_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub version: u32,
    pub current_snapshot: Option<String>,
    pub snapshot_bookmark: Option<u64>,
    pub last_seq: u64,
    pub current_segment: String,
    pub segments: Vec<WalSegmentMeta>,
}

pub struct WalSegment {
    pub path: PathBuf,
    file: File,
    pub bytes: u64,
}

pub struct WalWriter {
    inner: Arc<RwLock<WalInner>>,
    tx: mpsc::Sender<Enq>,
}

#[derive(Clone)]
struct WalHandle {
    dir: PathBuf,
    seg_size: u64,
    inner: Arc<RwLock<WalInner>>,
}

struct WalInner {
    segment: WalSegment,
    manifest: Manifest,
}

struct Enq {
    rec: Vec<u8>,
    seq: u64,
    ack: oneshot::Sender<()>,
}

static WAL_RECORDS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("wal_records_total", "wal records").unwrap());
static WAL_BYTES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("wal_bytes_total", "wal bytes").unwrap());
static WAL_FSYNC_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("wal_fsync_total", "wal fsyncs").unwrap());
static WAL_BATCH_BYTES: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("wal_batch_bytes", "wal batch sizes")).unwrap()
});
static WAL_FSYNC_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("wal_fsync_seconds", "wal fsync time")).unwrap()
});

impl WalWriter {
    pub fn open(dir: impl AsRef<Path>, seg_size: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("wal"))?;
        std::fs::create_dir_all(dir.join("snapshots"))?;
        let manifest_path = dir.join("manifest.json");
        let mut manifest: Manifest = if manifest_path.exists() {
            let s = std::fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&s).unwrap_or_default()
        } else {
            Manifest {
                version: 1,
                ..Default::default()
            }
        };
        let seg_name = if manifest.current_segment.is_empty() {
            Self::new_segment_name(manifest.segments.last())
        } else {
            manifest.current_segment.clone()
        };
        let seg_path = dir.join("wal").join(&seg_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&seg_path)?;
        let bytes = file.metadata()?.len();
        let segment = WalSegment {
            path: seg_path,
            file,
            bytes,
        };
        if manifest.segments.is_empty() {
            manifest.segments.push(WalSegmentMeta {
                name: seg_name.clone(),
                max_seq: 0,
            });
        }
        manifest.current_segment = seg_name;

        let reg = prometheus::default_registry();
        let _ = reg.register(Box::new(WAL_RECORDS_TOTAL.clone()));
        let _ = reg.register(Box::new(WAL_BYTES_TOTAL.clone()));
        let _ = reg.register(Box::new(WAL_FSYNC_TOTAL.clone()));
        let _ = reg.register(Box::new(WAL_BATCH_BYTES.clone()));
        let _ = reg.register(Box::new(WAL_FSYNC_SECONDS.clone()));

        let (tx, mut rx) = mpsc::channel::<Enq>(1024);
        let inner = Arc::new(RwLock::new(WalInner { segment, manifest }));
        let me = Self {
            inner: inner.clone(),
            tx,
        };
        let handle = WalHandle {
            dir,
            seg_size,
            inner,
        };
        tokio::spawn(async move {
            handle.fsync_worker(&mut rx).await;
        });
        Ok(me)
    }

    fn new_segment_name(prev: Option<&WalSegmentMeta>) -> String {
        if let Some(p) = prev {
            if let Ok(n) = p.name.trim_end_matches(".wal").parse::<u64>() {
                return format!("{:08}.wal", n + 1);
            }
        }
        "00000001.wal".to_string()
    }

    pub fn manifest(&self) -> Manifest {
        self.inner.read().manifest.clone()
    }

    pub fn update_manifest<F: FnOnce(&mut Manifest)>(&self, dir: &Path, f: F) -> std::io::Result<()> {
        let mut inner = self.inner.write();
        f(&mut inner.manifest);
        persist_manifest_at(dir, &inner.manifest)
    }

    /// Encode, enqueue and wait for the fsync worker's ack. Callers see a
    /// record as written only once it is on disk.
    pub async fn append(&self, seq: u64, ts: i64, body: &RecBody) -> std::io::Result<()> {
        let mut v = Vec::new();
        ser::into_writer(body, &mut v)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = v.len() as u32;
        let mut rec = Vec::with_capacity(HDR_LEN + v.len() + 4);
        rec.extend_from_slice(&MAGIC);
        rec.push(VER);
        rec.push(Self::rectype(body) as u8);
        rec.extend_from_slice(&seq.to_be_bytes());
        rec.extend_from_slice(&(ts as u64).to_be_bytes());
        rec.extend_from_slice(&len.to_be_bytes());
        rec.extend_from_slice(&v);
        let crc = crc32c(&rec);
        rec.extend_from_slice(&crc.to_be_bytes());
        WAL_RECORDS_TOTAL.inc();
        WAL_BYTES_TOTAL.inc_by(rec.len() as u64);
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Enq { rec, seq, ack })
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "wal worker gone"))?;
        rx.await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "wal worker gone"))?;
        Ok(())
    }

    fn rectype(b: &RecBody) -> RecType {
        match b {
            RecBody::QueueCreate { .. } => RecType::QueueCreate,
            RecBody::QueueDelete { .. } => RecType::QueueDelete,
            RecBody::QueuePurge { .. } => RecType::QueuePurge,
            RecBody::Insert { .. } => RecType::Insert,
            RecBody::Claim { .. } => RecType::Claim,
            RecBody::Tombstone { .. } => RecType::Tombstone,
        }
    }
}

impl WalHandle {
    async fn fsync_worker(self, rx: &mut mpsc::Receiver<Enq>) {
        let batch_max = std::env::var("WAL_BATCH_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256 * 1024);
        let batch_ms = std::env::var("WAL_BATCH_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(3);
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let mut bytes = batch[0].rec.len();
            let deadline = tokio::time::sleep(Duration::from_millis(batch_ms));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        if let Some(enq) = maybe {
                            bytes += enq.rec.len();
                            batch.push(enq);
                            if bytes >= batch_max { break; }
                        } else { break; }
                    },
                    _ = &mut deadline => break,
                }
            }
            let t0 = std::time::Instant::now();
            {
                let mut inner = self.inner.write();
                for enq in &batch {
                    let _ = inner.segment.file.write_all(&enq.rec);
                }
                inner.segment.bytes += bytes as u64;
                let last_seq = batch
                    .iter()
                    .map(|e| e.seq)
                    .max()
                    .unwrap_or(inner.manifest.last_seq);
                inner.manifest.last_seq = inner.manifest.last_seq.max(last_seq);
                if let Some(meta) = inner.manifest.segments.last_mut() {
                    meta.max_seq = meta.max_seq.max(last_seq);
                }
                let _ = inner.segment.file.flush();
                let _ = inner.segment.file.sync_data();
                WAL_FSYNC_TOTAL.inc();
                WAL_FSYNC_SECONDS.observe(t0.elapsed().as_secs_f64());
                WAL_BATCH_BYTES.observe(bytes as f64);
                let _ = persist_manifest_at(&self.dir, &inner.manifest);
                let rotate_at = std::env::var("WAL_SEGMENT_BYTES")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(self.seg_size);
                if inner.segment.bytes >= rotate_at {
                    let _ = self.rotate_locked(&mut inner);
                }
                for enq in batch {
                    let _ = enq.ack.send(());
                }
            }
        }
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> std::io::Result<()> {
        let name = WalWriter::new_segment_name(inner.manifest.segments.last());
        let seg_path = self.dir.join("wal").join(&name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&seg_path)?;
        inner.segment = WalSegment {
            path: seg_path,
            file,
            bytes: 0,
        };
        inner.manifest.current_segment = name.clone();
        inner.manifest.segments.push(WalSegmentMeta {
            name,
            max_seq: inner.manifest.last_seq,
        });
        persist_manifest_at(&self.dir, &inner.manifest)
    }
}

fn persist_manifest_at(dir: &Path, m: &Manifest) -> std::io::Result<()> {
    let tmp = dir.join("manifest.json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(m).unwrap_or_default())?;
    std::fs::rename(tmp, dir.join("manifest.json"))
}

/// Replays every manifest-listed segment in order. A torn or corrupt record
/// (bad magic, short read, crc mismatch) stops that segment's replay.
pub fn replay(dir: impl AsRef<Path>) -> std::io::Result<Vec<RecBody>> {
    let dir = dir.as_ref().to_path_buf();
    let manifest_path = dir.join("manifest.json");
    let manifest: Manifest = if manifest_path.exists() {
        let s = std::fs::read_to_string(&manifest_path)?;
        serde_json::from_str(&s).unwrap_or_default()
    } else {
        Manifest::default()
    };
    let mut out = Vec::new();
    for meta in manifest.segments.iter() {
        let p = dir.join("wal").join(&meta.name);
        if let Ok(mut f) = File::open(&p) {
            loop {
                let mut hdr = [0u8; HDR_LEN];
                if f.read_exact(&mut hdr).is_err() {
                    break;
                }
                if hdr[0..4] != MAGIC {
                    break;
                }
                let len = u32::from_be_bytes([hdr[22], hdr[23], hdr[24], hdr[25]]) as usize;
                let mut body = vec![0u8; len];
                if f.read_exact(&mut body).is_err() {
                    break;
                }
                let mut crcbuf = [0u8; 4];
                if f.read_exact(&mut crcbuf).is_err() {
                    break;
                }
                let mut rec = hdr.to_vec();
                rec.extend_from_slice(&body);
                if crc32c(&rec) != u32::from_be_bytes(crcbuf) {
                    tracing::warn!(segment = %meta.name, "crc mismatch, dropping wal tail");
                    break;
                }
                if let Ok(v) = ciborium::de::from_reader::<RecBody, _>(&body[..]) {
                    out.push(v);
                }
            }
        }
    }
    Ok(out)
}
