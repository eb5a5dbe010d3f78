//! Local delivery (§4.H): per-consumer-stream monotonic sequence IDs and
//! ack-based durable replay, via an append-then-fsync event log with
//! load-last-state recovery on reopen.

use crate::error::CoreResult;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// The five consumer streams named in §4.H / §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Pm,
    Gcm,
    Kx,
    Posts,
    PostsStatus,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Pm => "pm",
            StreamKind::Gcm => "gcm",
            StreamKind::Kx => "kx",
            StreamKind::Posts => "posts",
            StreamKind::PostsStatus => "posts_status",
        }
    }
}

/// One durably-recorded event, persisted before it is pushed to subscribers
/// (§4.H step 2). `payload` carries the already-serialized RPC event (§6);
/// local delivery is payload-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub sequence_id: u64,
    pub payload: serde_json::Value,
    pub acked: bool,
}

struct StreamState {
    next_seq: AtomicU64,
    pending: Mutex<BTreeMap<u64, DeliveryRecord>>,
    dir: PathBuf,
    tx: broadcast::Sender<DeliveryRecord>,
}

/// One ordered, durable, ack-tracked stream. `unacked_from` replay (§4.H,
/// §8) is implemented by `open_from`.
pub struct DeliveryStream {
    state: StreamState,
}

impl DeliveryStream {
    /// Load persisted state from `streams/<stream>/{seq,pending}` (§6),
    /// creating an empty stream if neither file exists yet.
    pub fn open(dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&dir).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        let seq_path = dir.join("seq");
        let pending_path = dir.join("pending");

        let next_seq = if seq_path.exists() {
            let bytes = fs::read(&seq_path).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
            let text = String::from_utf8_lossy(&bytes);
            text.trim().parse::<u64>().unwrap_or(0)
        } else {
            0
        };

        let pending: BTreeMap<u64, DeliveryRecord> = if pending_path.exists() {
            let bytes =
                fs::read(&pending_path).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        let (tx, _rx) = broadcast::channel(1024);
        Ok(Self {
            state: StreamState {
                next_seq: AtomicU64::new(next_seq),
                pending: Mutex::new(pending),
                dir,
                tx,
            },
        })
    }

    /// Assign the next sequence ID, persist the pending record, then return
    /// it for the caller to push to live subscribers (§4.H steps 1-3).
    pub fn emit(&self, payload: serde_json::Value) -> CoreResult<DeliveryRecord> {
        let sequence_id = self.state.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = DeliveryRecord {
            sequence_id,
            payload,
            acked: false,
        };
        {
            let mut pending = self.state.pending.lock();
            pending.insert(sequence_id, record.clone());
            self.persist(&pending, sequence_id)?;
        }
        let _ = self.state.tx.send(record.clone());
        Ok(record)
    }

    /// Ack up to and including `sequence_id`; idempotent re-acks of an
    /// already-passed high-water mark are a no-op (§8).
    pub fn ack(&self, sequence_id: u64) -> CoreResult<()> {
        let mut pending = self.state.pending.lock();
        let to_remove: Vec<u64> = pending
            .range(..=sequence_id)
            .map(|(seq, _)| *seq)
            .collect();
        if to_remove.is_empty() {
            return Ok(());
        }
        for seq in &to_remove {
            pending.remove(seq);
        }
        self.persist(&pending, self.state.next_seq.load(Ordering::SeqCst))
    }

    /// Every still-pending record with `sequence_id > unacked_from`, in
    /// order, for replay before live events (§4.H, §8).
    pub fn replay_from(&self, unacked_from: u64) -> Vec<DeliveryRecord> {
        self.state
            .pending
            .lock()
            .range((unacked_from + 1)..)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryRecord> {
        self.state.tx.subscribe()
    }

    pub fn high_water_mark(&self) -> u64 {
        self.state.next_seq.load(Ordering::SeqCst)
    }

    /// Drop all acked records below a cutoff. Here "acked" already means
    /// removed from `pending`, so compaction is simply truncating the seq
    /// counter's backing file; kept as an explicit step to mirror the
    /// spec's "a compactor periodically drops acked records" (§4.H).
    pub fn compact(&self) -> CoreResult<()> {
        let pending = self.state.pending.lock();
        self.persist(&pending, self.state.next_seq.load(Ordering::SeqCst))
    }

    fn persist(&self, pending: &BTreeMap<u64, DeliveryRecord>, seq: u64) -> CoreResult<()> {
        write_atomic(&self.state.dir.join("seq"), seq.to_string().as_bytes())?;
        let bytes = serde_json::to_vec(pending)
            .map_err(|e| crate::error::CoreError::Fatal(format!("serialize pending: {e}")))?;
        write_atomic(&self.state.dir.join("pending"), &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let staging = path.with_extension("staging");
    {
        let mut f =
            File::create(&staging).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        f.write_all(bytes)
            .map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        f.sync_all()
            .map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    }
    fs::rename(&staging, path).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    Ok(())
}

/// Owns one `DeliveryStream` per [`StreamKind`] for a single local identity.
pub struct DeliveryHub {
    pm: DeliveryStream,
    gcm: DeliveryStream,
    kx: DeliveryStream,
    posts: DeliveryStream,
    posts_status: DeliveryStream,
}

impl DeliveryHub {
    pub fn open(streams_root: &Path) -> CoreResult<Self> {
        Ok(Self {
            pm: DeliveryStream::open(streams_root.join(StreamKind::Pm.as_str()))?,
            gcm: DeliveryStream::open(streams_root.join(StreamKind::Gcm.as_str()))?,
            kx: DeliveryStream::open(streams_root.join(StreamKind::Kx.as_str()))?,
            posts: DeliveryStream::open(streams_root.join(StreamKind::Posts.as_str()))?,
            posts_status: DeliveryStream::open(streams_root.join(StreamKind::PostsStatus.as_str()))?,
        })
    }

    pub fn stream(&self, kind: StreamKind) -> &DeliveryStream {
        match kind {
            StreamKind::Pm => &self.pm,
            StreamKind::Gcm => &self.gcm,
            StreamKind::Kx => &self.kx,
            StreamKind::Posts => &self.posts,
            StreamKind::PostsStatus => &self.posts_status,
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn emit_assigns_monotonic_sequence_ids() {
        let dir = tempdir().unwrap();
        let stream = DeliveryStream::open(dir.path().to_path_buf()).unwrap();
        let r1 = stream.emit(serde_json::json!({"msg": "a"})).unwrap();
        let r2 = stream.emit(serde_json::json!({"msg": "b"})).unwrap();
        assert_eq!(r1.sequence_id, 1);
        assert_eq!(r2.sequence_id, 2);
    }

    #[test]
    fn replay_from_returns_only_events_after_cutoff() {
        let dir = tempdir().unwrap();
        let stream = DeliveryStream::open(dir.path().to_path_buf()).unwrap();
        stream.emit(serde_json::json!(1)).unwrap();
        stream.emit(serde_json::json!(2)).unwrap();
        stream.emit(serde_json::json!(3)).unwrap();
        let replay = stream.replay_from(1);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence_id, 2);
    }

    #[test]
    fn ack_is_idempotent_past_high_water_mark() {
        let dir = tempdir().unwrap();
        let stream = DeliveryStream::open(dir.path().to_path_buf()).unwrap();
        stream.emit(serde_json::json!(1)).unwrap();
        stream.ack(1).unwrap();
        stream.ack(1).unwrap();
        assert!(stream.replay_from(0).is_empty());
    }

    #[test]
    fn reopen_restores_pending_and_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let stream = DeliveryStream::open(path.clone()).unwrap();
            stream.emit(serde_json::json!("first")).unwrap();
            stream.emit(serde_json::json!("second")).unwrap();
            stream.ack(1).unwrap();
        }
        let reopened = DeliveryStream::open(path).unwrap();
        let replay = reopened.replay_from(0);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].sequence_id, 2);
        let r3 = reopened.emit(serde_json::json!("third")).unwrap();
        assert_eq!(r3.sequence_id, 3);
    }
}
