//! The Egress Buffer contract plus an in-memory and a
//! disk-spill implementation sharing the ordering rules in
//! `super::ordering`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::context::{Context, ContextError};
use super::message::CloudMessage;
use super::ordering::OrderedQueue;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("egress buffer is closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    Timeout,
    #[error("egress buffer io error: {0}")]
    Io(String),
    #[error("egress buffer record corrupt: {0}")]
    Corrupt(String),
}

impl From<ContextError> for EgressError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => EgressError::Cancelled,
            ContextError::DeadlineExceeded => EgressError::Timeout,
        }
    }
}

/// Durable-enough queue of outbound messages. In-memory and
/// disk-spill implementations share the same contract so the Cloud
/// Manager can drain either polymorphically.
#[async_trait]
pub trait EgressBuffer: Send + Sync {
    async fn add(&self, message: CloudMessage) -> Result<(), EgressError>;

    /// Waits (honoring `ctx`) until a message is due, then dequeues and
    /// returns the highest-ranked one. Returns `None` once the buffer is
    /// closed and drained.
    async fn next_due(&self, ctx: &Context) -> Result<Option<CloudMessage>, EgressError>;

    /// Idempotent: acking an id already acked, or never dequeued, is a
    /// silent no-op ("idempotent ack").
    async fn ack(&self, id: Uuid);

    /// Re-enqueues a dequeued-but-undelivered message with an
    /// incremented retry count.
    async fn requeue(&self, id: Uuid, next_attempt_at: u64);

    async fn len(&self) -> usize;

    /// Count of messages dropped by the `max_size` eviction policy
    /// (`BufferFull`).
    async fn evicted_count(&self) -> u64;

    async fn close(&self) -> Result<(), EgressError>;
}

/// Waits on `queue`/`notify` until the highest-ranked queued message is
/// due, or the buffer closes and drains. Shared by both implementations
/// so the wait/backoff loop only needs to be gotten right once.
async fn wait_for_due(
    queue: &Mutex<OrderedQueue>,
    notify: &Notify,
    ctx: &Context,
) -> Result<Option<CloudMessage>, EgressError> {
    loop {
        let now = now_millis();
        enum Decision {
            Ready(CloudMessage),
            Drained,
            WaitUntil(Option<u64>),
        }
        let decision = {
            let mut q = queue.lock();
            if let Some(message) = q.pop_due(now) {
                Decision::Ready(message)
            } else if q.is_closed() && q.len() == 0 {
                Decision::Drained
            } else {
                Decision::WaitUntil(q.earliest_wait())
            }
        };
        match decision {
            Decision::Ready(message) => return Ok(Some(message)),
            Decision::Drained => return Ok(None),
            Decision::WaitUntil(earliest) => {
                let sleep_for = match earliest {
                    Some(ts) => Duration::from_millis(ts.saturating_sub(now)).max(Duration::from_millis(1)),
                    None => Duration::from_secs(3600),
                };
                let notified = notify.notified();
                ctx.run(sleep_for, async move {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = notified => {}
                    }
                })
                .await?;
            }
        }
    }
}

/// Ring-style in-memory implementation ("in-memory ring").
pub struct InMemoryEgressBuffer {
    queue: Mutex<OrderedQueue>,
    notify: Notify,
    evicted: AtomicU64,
}

impl InMemoryEgressBuffer {
    pub fn new(max_size: usize) -> Self {
        InMemoryEgressBuffer {
            queue: Mutex::new(OrderedQueue::new(max_size)),
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EgressBuffer for InMemoryEgressBuffer {
    async fn add(&self, message: CloudMessage) -> Result<(), EgressError> {
        let outcome = {
            let mut q = self.queue.lock();
            if q.is_closed() {
                return Err(EgressError::Closed);
            }
            q.push(message)
        };
        if outcome.evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_due(&self, ctx: &Context) -> Result<Option<CloudMessage>, EgressError> {
        wait_for_due(&self.queue, &self.notify, ctx).await
    }

    async fn ack(&self, id: Uuid) {
        self.queue.lock().ack(id);
    }

    async fn requeue(&self, id: Uuid, next_attempt_at: u64) {
        if self.queue.lock().requeue(id, next_attempt_at) {
            self.notify.notify_waiters();
        }
    }

    async fn len(&self) -> usize {
        self.queue.lock().len()
    }

    async fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), EgressError> {
        self.queue.lock().close();
        self.notify.notify_waiters();
        Ok(())
    }
}

const SEGMENT_MAGIC: [u8; 4] = *b"EGBF";
const SEGMENT_VERSION: u16 = 1;
const SEGMENT_HEADER_LEN: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Pending,
    Acked,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct IndexRecord {
    id: Uuid,
    segment: u32,
    offset: u64,
    state_acked: bool,
}

struct IndexEntry {
    segment: u32,
    offset: u64,
    state: RecordState,
}

/// The live segment file plus its current write offset, kept behind one
/// lock so reserving the offset and appending the record are one atomic
/// step. Splitting these (an atomic offset counter alongside a
/// separately-locked file opened in append mode) lets two concurrent
/// writers race: whichever wins the file lock appends at true EOF, which
/// may not be the offset the other writer reserved, so the index and the
/// on-disk position diverge.
struct SegmentWriter {
    file: tokio::fs::File,
    offset: u64,
}

/// Disk-spill implementation: a single append-only
/// segment log of length-prefixed `CloudMessage` records plus a sidecar
/// index log of `IndexRecord`s. `open` replays the index to recover
/// in-flight and pending messages after a restart; `compact` rewrites
/// live records into a fresh segment.
pub struct DiskSpillEgressBuffer {
    dir: PathBuf,
    queue: Mutex<OrderedQueue>,
    notify: Notify,
    evicted: AtomicU64,
    index: Mutex<std::collections::HashMap<Uuid, IndexEntry>>,
    segment_id: Mutex<u32>,
    segment: tokio::sync::Mutex<SegmentWriter>,
    index_file: tokio::sync::Mutex<tokio::fs::File>,
}

impl DiskSpillEgressBuffer {
    fn segment_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("segment-{id:010}.log"))
    }

    fn index_path(dir: &Path) -> PathBuf {
        dir.join("index.log")
    }

    pub async fn open(dir: impl Into<PathBuf>, max_size: usize) -> Result<Self, EgressError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| EgressError::Io(e.to_string()))?;

        let index_path = Self::index_path(&dir);
        let mut index_bytes = Vec::new();
        if index_path.exists() {
            let mut f = tokio::fs::File::open(&index_path).await.map_err(|e| EgressError::Io(e.to_string()))?;
            f.read_to_end(&mut index_bytes).await.map_err(|e| EgressError::Io(e.to_string()))?;
        }
        let mut index = std::collections::HashMap::new();
        for line in index_bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let rec: IndexRecord = serde_json::from_slice(line).map_err(|e| EgressError::Corrupt(e.to_string()))?;
            index.insert(
                rec.id,
                IndexEntry {
                    segment: rec.segment,
                    offset: rec.offset,
                    state: if rec.state_acked { RecordState::Acked } else { RecordState::Pending },
                },
            );
        }

        let segment_id = index.values().map(|e| e.segment).max().unwrap_or(0);
        let segment_path = Self::segment_path(&dir, segment_id);
        let segment_offset = if segment_path.exists() {
            let meta = tokio::fs::metadata(&segment_path).await.map_err(|e| EgressError::Io(e.to_string()))?;
            Self::validate_header(&segment_path).await?;
            meta.len()
        } else {
            Self::write_new_segment_header(&segment_path).await?;
            SEGMENT_HEADER_LEN
        };

        let mut recovered = Vec::new();
        for entry in index.values().filter(|e| e.state == RecordState::Pending) {
            if let Some(message) = Self::read_record(&dir, entry.segment, entry.offset).await? {
                recovered.push(message);
            }
        }

        let segment_file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&segment_path)
            .await
            .map_err(|e| EgressError::Io(e.to_string()))?;
        let index_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)
            .await
            .map_err(|e| EgressError::Io(e.to_string()))?;

        Ok(DiskSpillEgressBuffer {
            dir,
            queue: Mutex::new(OrderedQueue::from_recovered(max_size, recovered)),
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
            index: Mutex::new(index),
            segment_id: Mutex::new(segment_id),
            segment: tokio::sync::Mutex::new(SegmentWriter { file: segment_file, offset: segment_offset }),
            index_file: tokio::sync::Mutex::new(index_file),
        })
    }

    async fn write_new_segment_header(path: &Path) -> Result<(), EgressError> {
        let mut f = tokio::fs::File::create(path).await.map_err(|e| EgressError::Io(e.to_string()))?;
        f.write_all(&SEGMENT_MAGIC).await.map_err(|e| EgressError::Io(e.to_string()))?;
        f.write_all(&SEGMENT_VERSION.to_le_bytes()).await.map_err(|e| EgressError::Io(e.to_string()))?;
        f.flush().await.map_err(|e| EgressError::Io(e.to_string()))?;
        Ok(())
    }

    async fn validate_header(path: &Path) -> Result<(), EgressError> {
        let mut f = tokio::fs::File::open(path).await.map_err(|e| EgressError::Io(e.to_string()))?;
        let mut header = [0u8; 6];
        f.read_exact(&mut header).await.map_err(|e| EgressError::Io(e.to_string()))?;
        if header[0..4] != SEGMENT_MAGIC {
            return Err(EgressError::Corrupt(format!("bad segment magic in {}", path.display())));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SEGMENT_VERSION {
            return Err(EgressError::Corrupt(format!("unsupported segment version {version} in {}", path.display())));
        }
        Ok(())
    }

    async fn read_record(dir: &Path, segment: u32, offset: u64) -> Result<Option<CloudMessage>, EgressError> {
        use tokio::io::AsyncSeekExt;
        let path = Self::segment_path(dir, segment);
        let mut f = tokio::fs::File::open(&path).await.map_err(|e| EgressError::Io(e.to_string()))?;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| EgressError::Io(e.to_string()))?;
        let mut len_bytes = [0u8; 4];
        if f.read_exact(&mut len_bytes).await.is_err() {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        f.read_exact(&mut payload).await.map_err(|e| EgressError::Io(e.to_string()))?;
        let message: CloudMessage = serde_json::from_slice(&payload).map_err(|e| EgressError::Corrupt(e.to_string()))?;
        Ok(Some(message))
    }

    async fn append_index_record(&self, rec: &IndexRecord) -> Result<(), EgressError> {
        let mut line = serde_json::to_vec(rec).map_err(|e| EgressError::Corrupt(e.to_string()))?;
        line.push(b'\n');
        let mut f = self.index_file.lock().await;
        f.write_all(&line).await.map_err(|e| EgressError::Io(e.to_string()))?;
        f.flush().await.map_err(|e| EgressError::Io(e.to_string()))?;
        Ok(())
    }

    /// Rewrites all still-pending records into a fresh segment and drops
    /// segments that carry no live records ("Compaction
    /// rewrites live records into new segments and removes segments
    /// with no live records").
    pub async fn compact(&self) -> Result<(), EgressError> {
        let pending_locations: Vec<(Uuid, u32, u64)> = self
            .index
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == RecordState::Pending)
            .map(|(id, entry)| (*id, entry.segment, entry.offset))
            .collect();
        let mut pending = Vec::with_capacity(pending_locations.len());
        for (id, segment, offset) in pending_locations {
            if let Some(message) = Self::read_record(&self.dir, segment, offset).await? {
                pending.push((id, message));
            }
        }

        let new_segment_id = {
            let mut seg = self.segment_id.lock();
            *seg += 1;
            *seg
        };
        let new_path = Self::segment_path(&self.dir, new_segment_id);
        Self::write_new_segment_header(&new_path).await?;
        let mut new_file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&new_path)
            .await
            .map_err(|e| EgressError::Io(e.to_string()))?;

        let mut new_index = std::collections::HashMap::new();
        let mut offset = SEGMENT_HEADER_LEN;
        for (id, message) in &pending {
            let bytes = serde_json::to_vec(message).map_err(|e| EgressError::Corrupt(e.to_string()))?;
            let len = bytes.len() as u32;
            new_file.write_all(&len.to_le_bytes()).await.map_err(|e| EgressError::Io(e.to_string()))?;
            new_file.write_all(&bytes).await.map_err(|e| EgressError::Io(e.to_string()))?;
            new_index.insert(
                *id,
                IndexEntry {
                    segment: new_segment_id,
                    offset,
                    state: RecordState::Pending,
                },
            );
            offset += 4 + len as u64;
        }
        new_file.flush().await.map_err(|e| EgressError::Io(e.to_string()))?;

        let stale_segments: std::collections::HashSet<u32> = {
            self.index.lock().values().map(|e| e.segment).collect()
        };

        {
            let mut segment = self.segment.lock().await;
            *segment = SegmentWriter { file: new_file, offset };
        }
        *self.index.lock() = new_index;

        let fresh_index_path = Self::index_path(&self.dir);
        let rebuilt = tokio::fs::File::create(&fresh_index_path).await.map_err(|e| EgressError::Io(e.to_string()))?;
        *self.index_file.lock().await = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&fresh_index_path)
            .await
            .map_err(|e| EgressError::Io(e.to_string()))?;
        drop(rebuilt);
        for (id, entry) in self.index.lock().iter() {
            self.append_index_record(&IndexRecord {
                id: *id,
                segment: entry.segment,
                offset: entry.offset,
                state_acked: false,
            })
            .await?;
        }

        for segment in stale_segments {
            if segment != new_segment_id {
                let _ = tokio::fs::remove_file(Self::segment_path(&self.dir, segment)).await;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EgressBuffer for DiskSpillEgressBuffer {
    async fn add(&self, message: CloudMessage) -> Result<(), EgressError> {
        let bytes = serde_json::to_vec(&message).map_err(|e| EgressError::Corrupt(e.to_string()))?;
        let len = bytes.len() as u32;
        let segment = *self.segment_id.lock();
        // Reserve the offset and append the record while holding the one
        // lock that also owns the file, so concurrent `add`s (overlapping
        // cloud-manager flushes can both spill at once) never race between
        // "decide where this record goes" and "write it there".
        let offset = {
            let mut writer = self.segment.lock().await;
            let offset = writer.offset;
            writer.file.write_all(&len.to_le_bytes()).await.map_err(|e| EgressError::Io(e.to_string()))?;
            writer.file.write_all(&bytes).await.map_err(|e| EgressError::Io(e.to_string()))?;
            writer.file.flush().await.map_err(|e| EgressError::Io(e.to_string()))?;
            writer.offset += 4 + len as u64;
            offset
        };
        self.append_index_record(&IndexRecord {
            id: message.id,
            segment,
            offset,
            state_acked: false,
        })
        .await?;
        self.index.lock().insert(
            message.id,
            IndexEntry {
                segment,
                offset,
                state: RecordState::Pending,
            },
        );

        let outcome = {
            let mut q = self.queue.lock();
            if q.is_closed() {
                return Err(EgressError::Closed);
            }
            q.push(message)
        };
        if outcome.evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_due(&self, ctx: &Context) -> Result<Option<CloudMessage>, EgressError> {
        wait_for_due(&self.queue, &self.notify, ctx).await
    }

    async fn ack(&self, id: Uuid) {
        let Some(message) = self.queue.lock().ack(id) else {
            return;
        };
        let location = {
            let mut index = self.index.lock();
            let Some(entry) = index.get_mut(&message.id) else {
                return;
            };
            entry.state = RecordState::Acked;
            (entry.segment, entry.offset)
        };
        let _ = self
            .append_index_record(&IndexRecord {
                id: message.id,
                segment: location.0,
                offset: location.1,
                state_acked: true,
            })
            .await;
    }

    async fn requeue(&self, id: Uuid, next_attempt_at: u64) {
        if self.queue.lock().requeue(id, next_attempt_at) {
            self.notify.notify_waiters();
        }
    }

    async fn len(&self) -> usize {
        self.queue.lock().len()
    }

    async fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), EgressError> {
        self.queue.lock().close();
        self.notify.notify_waiters();
        Ok(())
    }
}
