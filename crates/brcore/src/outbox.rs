//! Outbox / RMQ (§4.E): a durable, per-peer FIFO of outbound routed messages
//! with at-least-once delivery, using an append-then-fsync idiom for
//! enqueue and staging-file-then-atomic-rename for entry updates.

use crate::config::BackoffConfig;
use crate::error::CoreResult;
use crate::ratchet::RvTag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type UserId = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Queued,
    Sending,
    Acked,
    FailedRetriable,
    FailedFatal,
}

/// One entry in a peer's FIFO (§3). `rm_bytes` is the already ratchet-sealed
/// ciphertext, queued alongside the one-shot `rv` tag it was derived for —
/// the tag is single-use (§3), so it must be captured at `next_tag_send`
/// time and carried with the entry rather than re-derived or approximated
/// by a constant like the peer's UserID at push time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub seq: u64,
    pub target: String, // hex UserId
    pub rv: RvTag,
    pub rm_bytes: Vec<u8>,
    pub priority: u8,
    pub attempt: u32,
    pub payment_hint: Option<String>,
    pub status: OutboxStatus,
}

struct PeerLane {
    dir: PathBuf,
    entries: VecDeque<OutboxEntry>,
    next_seq: u64,
}

/// Durable per-peer FIFO lanes for one local identity, with a shared backoff
/// policy for retries (§4.E, §9 `outbox_backoff`).
pub struct Outbox {
    lanes: Mutex<HashMap<String, PeerLane>>,
    root: PathBuf,
    backoff: BackoffConfig,
}

impl Outbox {
    pub fn open(root: PathBuf, backoff: BackoffConfig) -> CoreResult<Self> {
        fs::create_dir_all(&root).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        let mut lanes = HashMap::new();
        if let Ok(read_dir) = fs::read_dir(&root) {
            for entry in read_dir.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let Some(uid_hex) = entry.file_name().to_str().map(|s| s.to_string()) else {
                    continue;
                };
                let lane = load_lane(entry.path(), &uid_hex)?;
                lanes.insert(uid_hex, lane);
            }
        }
        Ok(Self {
            lanes: Mutex::new(lanes),
            root,
            backoff,
        })
    }

    /// Append on user request or by internal protocols (§3). Durably
    /// recorded (fsync) before the caller returns, satisfying "E is
    /// persisted before its ciphertext is pushed" (§8).
    pub fn enqueue(
        &self,
        target: UserId,
        rv: RvTag,
        rm_bytes: Vec<u8>,
        priority: u8,
        payment_hint: Option<String>,
    ) -> CoreResult<OutboxEntry> {
        let uid_hex = hex::encode(target);
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(uid_hex.clone()).or_insert_with(|| PeerLane {
            dir: self.root.join(&uid_hex),
            entries: VecDeque::new(),
            next_seq: 0,
        });
        let seq = lane.next_seq;
        lane.next_seq += 1;
        let entry = OutboxEntry {
            seq,
            target: uid_hex,
            rv,
            rm_bytes,
            priority,
            attempt: 0,
            payment_hint,
            status: OutboxStatus::Queued,
        };
        persist_entry(&lane.dir, &entry)?;
        lane.entries.push_back(entry.clone());
        Ok(entry)
    }

    /// The next queued-or-retriable entry for `target`, in FIFO order
    /// (§4.E "within a single peer, messages are pushed in the order
    /// enqueued"). Across peers no order is implied by iteration order.
    pub fn peek_front(&self, target: &UserId) -> Option<OutboxEntry> {
        let lanes = self.lanes.lock();
        lanes
            .get(&hex::encode(target))
            .and_then(|lane| lane.entries.front().cloned())
    }

    pub fn all_targets(&self) -> Vec<UserId> {
        self.lanes
            .lock()
            .keys()
            .filter_map(|hex_str| hex::decode(hex_str).ok())
            .filter_map(|b| b.try_into().ok())
            .collect()
    }

    pub fn mark_sending(&self, target: &UserId, seq: u64) -> CoreResult<()> {
        self.update_front(target, seq, |e| {
            e.status = OutboxStatus::Sending;
            e.attempt += 1;
        })
    }

    /// On server-ack, removes the entry entirely — it has been durably
    /// delivered and the ratchet counter on the receiving side dedupes any
    /// accidental re-push (§8 at-least-once property).
    pub fn mark_acked(&self, target: &UserId, seq: u64) -> CoreResult<()> {
        let uid_hex = hex::encode(target);
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(&uid_hex) else {
            return Ok(());
        };
        if let Some(front) = lane.entries.front() {
            if front.seq == seq {
                lane.entries.pop_front();
                remove_entry_file(&lane.dir, seq)?;
            }
        }
        Ok(())
    }

    /// Retriable failure: bump attempt count, compute the capped
    /// exponential backoff delay, and leave the entry at the front of the
    /// lane for the retry scheduler.
    pub fn mark_failed_retriable(&self, target: &UserId, seq: u64) -> CoreResult<Duration> {
        self.update_front(target, seq, |e| e.status = OutboxStatus::FailedRetriable)?;
        let attempt = self
            .lanes
            .lock()
            .get(&hex::encode(target))
            .and_then(|l| l.entries.front())
            .map(|e| e.attempt)
            .unwrap_or(1);
        Ok(self.backoff_delay(attempt))
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ms = self.backoff.base_ms as f64 * self.backoff.multiplier.powi(attempt.max(1) as i32 - 1);
        Duration::from_millis((ms as u64).min(self.backoff.cap_ms))
    }

    /// Fatal failure (ratchet exhausted, peer forgotten): the entry is
    /// surfaced to the caller as an error and removed, never retried.
    pub fn mark_failed_fatal(&self, target: &UserId, seq: u64) -> CoreResult<()> {
        let uid_hex = hex::encode(target);
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(&uid_hex) {
            if let Some(front) = lane.entries.front() {
                if front.seq == seq {
                    lane.entries.pop_front();
                    remove_entry_file(&lane.dir, seq)?;
                }
            }
        }
        Ok(())
    }

    fn update_front(
        &self,
        target: &UserId,
        seq: u64,
        f: impl FnOnce(&mut OutboxEntry),
    ) -> CoreResult<()> {
        let uid_hex = hex::encode(target);
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(&uid_hex) else {
            return Ok(());
        };
        if let Some(front) = lane.entries.front_mut() {
            if front.seq == seq {
                f(front);
                let snapshot = front.clone();
                persist_entry(&lane.dir, &snapshot)?;
            }
        }
        Ok(())
    }
}

fn load_lane(dir: PathBuf, uid_hex: &str) -> CoreResult<PeerLane> {
    let mut entries: Vec<OutboxEntry> = Vec::new();
    if let Ok(read_dir) = fs::read_dir(&dir) {
        for file in read_dir.flatten() {
            let Ok(bytes) = fs::read(file.path()) else {
                continue;
            };
            if let Ok(entry) = serde_json::from_slice::<OutboxEntry>(&bytes) {
                entries.push(entry);
            }
        }
    }
    entries.sort_by_key(|e| e.seq);
    let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(0);
    let _ = uid_hex;
    Ok(PeerLane {
        dir,
        entries: entries.into(),
        next_seq,
    })
}

fn persist_entry(dir: &Path, entry: &OutboxEntry) -> CoreResult<()> {
    fs::create_dir_all(dir).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    let path = dir.join(entry.seq.to_string());
    let staging = dir.join(format!("{}.staging", entry.seq));
    let bytes = serde_json::to_vec(entry)
        .map_err(|e| crate::error::CoreError::Fatal(format!("serialize outbox entry: {e}")))?;
    {
        let mut f =
            File::create(&staging).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        f.write_all(&bytes)
            .map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
        f.sync_all()
            .map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    }
    fs::rename(&staging, &path).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    Ok(())
}

fn remove_entry_file(dir: &Path, seq: u64) -> CoreResult<()> {
    let path = dir.join(seq.to_string());
    if path.exists() {
        fs::remove_file(path).map_err(|e| crate::error::CoreError::Fatal(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            base_ms: 100,
            cap_ms: 1000,
            multiplier: 2.0,
        }
    }

    #[test]
    fn enqueue_then_ack_clears_entry() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path().to_path_buf(), backoff()).unwrap();
        let uid = [1u8; 32];
        let entry = outbox.enqueue(uid, RvTag([10u8; 32]), b"rm".to_vec(), 0, None).unwrap();
        assert!(outbox.peek_front(&uid).is_some());
        outbox.mark_sending(&uid, entry.seq).unwrap();
        outbox.mark_acked(&uid, entry.seq).unwrap();
        assert!(outbox.peek_front(&uid).is_none());
    }

    #[test]
    fn fifo_order_preserved_per_peer() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path().to_path_buf(), backoff()).unwrap();
        let uid = [2u8; 32];
        outbox.enqueue(uid, RvTag([11u8; 32]), b"first".to_vec(), 0, None).unwrap();
        outbox.enqueue(uid, RvTag([12u8; 32]), b"second".to_vec(), 0, None).unwrap();
        let front = outbox.peek_front(&uid).unwrap();
        assert_eq!(front.rm_bytes, b"first");
    }

    #[test]
    fn backoff_caps_at_configured_bound() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path().to_path_buf(), backoff()).unwrap();
        let delay = outbox.backoff_delay(20);
        assert_eq!(delay, Duration::from_millis(1000));
    }

    #[test]
    fn reopen_restores_pending_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let uid = [3u8; 32];
        {
            let outbox = Outbox::open(path.clone(), backoff()).unwrap();
            outbox.enqueue(uid, RvTag([13u8; 32]), b"persisted".to_vec(), 0, None).unwrap();
        }
        let reopened = Outbox::open(path, backoff()).unwrap();
        let front = reopened.peek_front(&uid).unwrap();
        assert_eq!(front.rm_bytes, b"persisted");
    }
}
