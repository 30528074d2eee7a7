use ciborium::ser;
use crc32c::crc32c;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use picshare_core::{Picture, PictureId, Rating, Tag, TagId, User, UserId};
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

const MAGIC: [u8; 4] = *b"PSJL";
const VER: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RecType {
    User = 1,
    Tag = 2,
    Picture = 3,
    Description = 4,
    PictureDelete = 5,
    Rating = 6,
    RatingDelete = 7,
}

// Put records carry the full row, so replaying a record twice converges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecBody {
    PutUser {
        user: User,
    },
    PutTag {
        tag: Tag,
    },
    PutPicture {
        picture: Picture,
        tag_ids: Vec<TagId>,
    },
    SetDescription {
        picture_id: PictureId,
        description: Option<String>,
    },
    DeletePicture {
        picture_id: PictureId,
    },
    PutRating {
        rating: Rating,
    },
    DeleteRating {
        picture_id: PictureId,
        user_id: UserId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SegmentMeta {
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
    pub segments: Vec<SegmentMeta>,
}

pub struct JournalSegment {
    pub path: PathBuf,
    file: File,
    pub bytes: u64,
}

pub struct JournalWriter {
    dir: PathBuf,
    seg_size: u64,
    inner: Arc<RwLock<JournalInner>>,
    tx: mpsc::Sender<Enq>,
}

#[derive(Clone)]
struct JournalHandle {
    dir: PathBuf,
    seg_size: u64,
    inner: Arc<RwLock<JournalInner>>,
}

struct JournalInner {
    pub segment: JournalSegment,
    pub manifest: Manifest,
}

struct Enq {
    rec: Vec<u8>,
    seq: u64,
    ack: oneshot::Sender<()>,
}

static JOURNAL_RECORDS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("journal_records_total", "journal records").unwrap());
static JOURNAL_BYTES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("journal_bytes_total", "journal bytes").unwrap());
static JOURNAL_FSYNC_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("journal_fsync_total", "journal fsyncs").unwrap());
static JOURNAL_BATCH_BYTES: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("journal_batch_bytes", "journal batch sizes")).unwrap()
});
static JOURNAL_FSYNC_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("journal_fsync_seconds", "journal fsync time")).unwrap()
});

impl JournalWriter {
    pub fn open(dir: impl AsRef<Path>, seg_size: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("journal"))?;
        std::fs::create_dir_all(dir.join("snapshots"))?;
        let manifest_path = dir.join("manifest.json");
        let mut manifest: Manifest = if manifest_path.exists() {
            let s = std::fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&s).unwrap_or_default()
        } else {
            Manifest {
                version: 1,
                current_snapshot: None,
                snapshot_bookmark: None,
                last_seq: 0,
                current_segment: String::new(),
                segments: vec![],
            }
        };
        let seg_name = if manifest.current_segment.is_empty() {
            Self::new_segment_name(manifest.segments.last())
        } else {
            manifest.current_segment.clone()
        };
        let seg_path = dir.join("journal").join(&seg_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&seg_path)?;
        let bytes = file.metadata()?.len();
        let segment = JournalSegment {
            path: seg_path,
            file,
            bytes,
        };
        if manifest.segments.is_empty() {
            manifest.segments.push(SegmentMeta {
                name: seg_name.clone(),
                max_seq: 0,
            });
        }
        manifest.current_segment = seg_name;
        let (tx, mut rx) = mpsc::channel::<Enq>(1024);
        // register metrics in default registry; re-registration across
        // stores in one process is tolerated
        let reg = prometheus::default_registry();
        let _ = reg.register(Box::new(JOURNAL_RECORDS_TOTAL.clone()));
        let _ = reg.register(Box::new(JOURNAL_BYTES_TOTAL.clone()));
        let _ = reg.register(Box::new(JOURNAL_FSYNC_TOTAL.clone()));
        let _ = reg.register(Box::new(JOURNAL_BATCH_BYTES.clone()));
        let _ = reg.register(Box::new(JOURNAL_FSYNC_SECONDS.clone()));

        let inner = Arc::new(RwLock::new(JournalInner { segment, manifest }));
        let me = Self {
            dir: dir.clone(),
            seg_size,
            inner: inner.clone(),
            tx,
        };
        let handle = JournalHandle {
            dir,
            seg_size,
            inner,
        };
        tokio::spawn(async move {
            handle.fsync_worker(&mut rx).await;
        });
        Ok(me)
    }

    fn new_segment_name(prev: Option<&SegmentMeta>) -> String {
        if let Some(p) = prev {
            if let Ok(n) = p.name.trim_end_matches(".jnl").parse::<u64>() {
                return format!("{:08}.jnl", n + 1);
            }
        }
        "00000001.jnl".to_string()
    }

    pub fn manifest(&self) -> Manifest {
        self.inner.read().manifest.clone()
    }

    // The bookmark is the sequence the snapshot is valid at; restore skips
    // records at or below it.
    pub fn set_snapshot(&self, name: String, bookmark: u64) -> std::io::Result<()> {
        let mut inner = self.inner.write();
        inner.manifest.current_snapshot = Some(name);
        inner.manifest.snapshot_bookmark = Some(bookmark);
        persist_manifest_at(&self.dir, &inner.manifest)
    }

    // Deletes segments fully covered by the current snapshot, keeping the
    // newest pre-bookmark one as margin.
    pub fn trim_segments(&self, snapshot_id: &str) -> std::io::Result<Vec<String>> {
        let mut inner = self.inner.write();
        if inner.manifest.current_snapshot.as_deref() != Some(snapshot_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "snapshot id mismatch",
            ));
        }
        let cutoff = inner.manifest.snapshot_bookmark.unwrap_or(0);
        let mut deleted = Vec::new();
        let mut retain = Vec::new();
        let mut last_before_idx: Option<usize> = None;
        for (i, seg) in inner.manifest.segments.iter().enumerate() {
            if seg.max_seq < cutoff {
                last_before_idx = Some(i);
            }
        }
        for (i, seg) in inner.manifest.segments.iter().enumerate() {
            if seg.max_seq < cutoff && Some(i) != last_before_idx {
                let p = self.dir.join("journal").join(&seg.name);
                let _ = std::fs::remove_file(&p);
                deleted.push(seg.name.clone());
            } else {
                retain.push(seg.clone());
            }
        }
        inner.manifest.segments = retain;
        persist_manifest_at(&self.dir, &inner.manifest)?;
        Ok(deleted)
    }

    pub async fn append(&self, seq: u64, ts: i64, body: &RecBody) -> std::io::Result<()> {
        let mut v = Vec::new();
        ser::into_writer(body, &mut v)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = v.len() as u32;
        let reserved = 0u64;
        let mut rec = Vec::with_capacity(4 + 1 + 1 + 8 + 8 + 8 + 4 + v.len() + 4);
        rec.extend_from_slice(&MAGIC);
        rec.push(VER);
        rec.push(Self::rectype(body) as u8);
        rec.extend_from_slice(&reserved.to_be_bytes());
        rec.extend_from_slice(&seq.to_be_bytes());
        rec.extend_from_slice(&(ts as u64).to_be_bytes());
        rec.extend_from_slice(&len.to_be_bytes());
        rec.extend_from_slice(&v);
        let crc = crc32c(&rec);
        rec.extend_from_slice(&crc.to_be_bytes());
        JOURNAL_RECORDS_TOTAL.inc();
        JOURNAL_BYTES_TOTAL.inc_by(rec.len() as u64);
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(Enq { rec, seq, ack: tx }).await;
        let _ = rx.await; // wait for fsync
        Ok(())
    }

    fn rectype(b: &RecBody) -> RecType {
        match b {
            RecBody::PutUser { .. } => RecType::User,
            RecBody::PutTag { .. } => RecType::Tag,
            RecBody::PutPicture { .. } => RecType::Picture,
            RecBody::SetDescription { .. } => RecType::Description,
            RecBody::DeletePicture { .. } => RecType::PictureDelete,
            RecBody::PutRating { .. } => RecType::Rating,
            RecBody::DeleteRating { .. } => RecType::RatingDelete,
        }
    }
}

impl JournalHandle {
    async fn fsync_worker(self, rx: &mut mpsc::Receiver<Enq>) {
        let batch_max = std::env::var("JOURNAL_BATCH_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256 * 1024);
        let batch_ms = std::env::var("JOURNAL_BATCH_MAX_MS")
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
                    .last()
                    .map(|e| e.seq)
                    .unwrap_or(inner.manifest.last_seq);
                inner.manifest.last_seq = inner.manifest.last_seq.max(last_seq);
                if let Some(meta) = inner.manifest.segments.last_mut() {
                    meta.max_seq = meta.max_seq.max(last_seq);
                }
                let _ = inner.segment.file.flush();
                // sync_data skips the metadata sync; good enough for frames
                // that are self-validating on replay
                let _ = inner.segment.file.sync_data();
                JOURNAL_FSYNC_TOTAL.inc();
                JOURNAL_FSYNC_SECONDS.observe(t0.elapsed().as_secs_f64());
                JOURNAL_BATCH_BYTES.observe(bytes as f64);
                let _ = persist_manifest_at(&self.dir, &inner.manifest);
                let rotate_at = std::env::var("JOURNAL_SEGMENT_BYTES")
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

    fn rotate_locked(&self, inner: &mut JournalInner) -> std::io::Result<()> {
        let name = JournalWriter::new_segment_name(inner.manifest.segments.last());
        let seg_path = self.dir.join("journal").join(&name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&seg_path)?;
        inner.segment = JournalSegment {
            path: seg_path,
            file,
            bytes: 0,
        };
        inner.manifest.current_segment = name.clone();
        inner.manifest.segments.push(SegmentMeta {
            name,
            max_seq: inner.manifest.last_seq,
        });
        persist_manifest_at(&self.dir, &inner.manifest)
    }
}

pub fn persist_manifest_at(dir: &Path, m: &Manifest) -> std::io::Result<()> {
    let tmp = dir.join("manifest.json.tmp");
    let body = serde_json::to_vec_pretty(m)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(tmp, dir.join("manifest.json"))
}

pub fn read_manifest(dir: impl AsRef<Path>) -> std::io::Result<Manifest> {
    let manifest_path = dir.as_ref().join("manifest.json");
    if manifest_path.exists() {
        let s = std::fs::read_to_string(&manifest_path)?;
        Ok(serde_json::from_str(&s).unwrap_or_default())
    } else {
        Ok(Manifest::default())
    }
}

// A torn or corrupt frame ends its segment; everything before it is kept.
pub fn replay(dir: impl AsRef<Path>) -> std::io::Result<Vec<(u64, RecBody)>> {
    let dir = dir.as_ref().to_path_buf();
    let manifest = read_manifest(&dir)?;
    let mut out = Vec::new();
    for meta in manifest.segments.iter() {
        let p = dir.join("journal").join(&meta.name);
        if let Ok(mut f) = File::open(&p) {
            loop {
                let mut hdr = [0u8; 4 + 1 + 1 + 8 + 8 + 8 + 4];
                if f.read_exact(&mut hdr).is_err() {
                    break;
                }
                if hdr[0..4] != MAGIC {
                    break;
                }
                let _ver = hdr[4];
                let _typ = hdr[5];
                let seq = u64::from_be_bytes(hdr[14..22].try_into().unwrap_or_default());
                let len = u32::from_be_bytes(hdr[30..34].try_into().unwrap_or_default()) as usize;
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
                let crc = crc32c(&rec);
                let got = u32::from_be_bytes(crcbuf);
                if crc != got {
                    break;
                }
                if let Ok(v) = ciborium::de::from_reader::<RecBody, _>(&body[..]) {
                    out.push((seq, v));
                }
            }
        }
    }
    Ok(out)
}
