//! User registry (§4.G): a guarded map of peer records backed by the
//! identity vault's KV section, with a `parking_lot::Mutex` per entry and a
//! `parking_lot::RwLock` around the map itself, to keep hot ratchet
//! mutation off the map-wide lock.

use crate::error::{CoreError, CoreResult, ProtocolError};
use crate::ratchet::{Ratchet, RatchetSnapshot};
use crate::vault::Vault;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub type UserId = [u8; 32];

/// Durable fields of a peer record (§3), persisted at
/// `peers/<uid-hex>/meta`. The ratchet itself is stored separately at
/// `peers/<uid-hex>/ratchet` since it mutates far more often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMeta {
    pub user_id_hex: String,
    pub nick: String,
    pub alias: Option<String>,
    pub last_send: Option<DateTime<Utc>>,
}

/// A peer record: identity plus the two ratchet-governed directions. Created
/// only by a completed KX; destroyed only by explicit `forget`.
pub struct PeerRecord {
    pub meta: RwLock<PeerMeta>,
    pub ratchet: Mutex<Ratchet>,
}

/// The guarded map of all known peers for one local identity.
pub struct UserRegistry {
    peers: RwLock<HashMap<UserId, Arc<PeerRecord>>>,
}

fn meta_key(user_id: &UserId) -> String {
    format!("peers.{}.meta", hex::encode(user_id))
}

fn ratchet_key(user_id: &UserId) -> String {
    format!("peers.{}.ratchet", hex::encode(user_id))
}

impl UserRegistry {
    /// Load every peer record the vault's KV section knows about.
    pub fn load(vault: &Vault) -> CoreResult<Self> {
        let mut peers = HashMap::new();
        for (key, _) in vault.payload.kv.iter() {
            let Some(rest) = key.strip_prefix("peers.") else {
                continue;
            };
            let Some(uid_hex) = rest.strip_suffix(".meta") else {
                continue;
            };
            let Ok(uid_bytes) = hex::decode(uid_hex) else {
                continue;
            };
            let Ok(user_id): Result<UserId, _> = uid_bytes.try_into() else {
                continue;
            };
            let meta_bytes = vault
                .get(&meta_key(&user_id))
                .map_err(|e| CoreError::Fatal(e.to_string()))?
                .ok_or_else(|| CoreError::Fatal("peer meta missing after key scan".into()))?;
            let meta: PeerMeta = serde_json::from_slice(&meta_bytes)
                .map_err(|e| CoreError::Fatal(format!("parse peer meta: {e}")))?;
            let ratchet_bytes = vault
                .get(&ratchet_key(&user_id))
                .map_err(|e| CoreError::Fatal(e.to_string()))?
                .ok_or_else(|| CoreError::Fatal("peer ratchet missing for known peer".into()))?;
            let snapshot: RatchetSnapshot = serde_json::from_slice(&ratchet_bytes)
                .map_err(|e| CoreError::Fatal(format!("parse peer ratchet: {e}")))?;
            let record = PeerRecord {
                meta: RwLock::new(meta),
                ratchet: Mutex::new(Ratchet::import(snapshot)),
            };
            peers.insert(user_id, Arc::new(record));
        }
        Ok(Self {
            peers: RwLock::new(peers),
        })
    }

    /// Create a new peer record from a completed KX and persist it.
    pub fn insert(
        &self,
        vault: &mut Vault,
        user_id: UserId,
        nick: String,
        ratchet: Ratchet,
    ) -> CoreResult<()> {
        let meta = PeerMeta {
            user_id_hex: hex::encode(user_id),
            nick,
            alias: None,
            last_send: None,
        };
        self.persist_meta(vault, &user_id, &meta)?;
        self.persist_ratchet(vault, &user_id, &ratchet)?;
        let record = Arc::new(PeerRecord {
            meta: RwLock::new(meta),
            ratchet: Mutex::new(ratchet),
        });
        self.peers.write().insert(user_id, record);
        Ok(())
    }

    /// Explicit "forget user" (§3 peer lifecycle): drop in-memory state and
    /// the durable blobs both.
    pub fn forget(&self, vault: &mut Vault, user_id: &UserId) -> CoreResult<()> {
        self.peers.write().remove(user_id);
        vault
            .remove(&meta_key(user_id))
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        vault
            .remove(&ratchet_key(user_id))
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        Ok(())
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<PeerRecord>> {
        self.peers.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.peers.read().contains_key(user_id)
    }

    pub fn all_ids(&self) -> Vec<UserId> {
        self.peers.read().keys().copied().collect()
    }

    /// Any ratchet advance must be fsync-durable before the corresponding
    /// network push (§4.G). Call this after `next_tag_send`/`try_decrypt`
    /// mutate the ratchet under its lock.
    pub fn persist_ratchet(
        &self,
        vault: &mut Vault,
        user_id: &UserId,
        ratchet: &Ratchet,
    ) -> CoreResult<()> {
        let bytes = serde_json::to_vec(&ratchet.export())
            .map_err(|e| CoreError::Fatal(format!("serialize ratchet: {e}")))?;
        vault
            .set(&ratchet_key(user_id), &bytes)
            .map_err(|e| CoreError::Fatal(e.to_string()))
    }

    /// Meta writes (nick/alias/last-seen) are coalesced under a write-behind
    /// policy in the full daemon; exposed here as a direct write since the
    /// vault's own save path is already atomic (fsync + rename).
    pub fn persist_meta(&self, vault: &mut Vault, user_id: &UserId, meta: &PeerMeta) -> CoreResult<()> {
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| CoreError::Fatal(format!("serialize peer meta: {e}")))?;
        vault
            .set(&meta_key(user_id), &bytes)
            .map_err(|e| CoreError::Fatal(e.to_string()))
    }

    pub fn set_alias(&self, vault: &mut Vault, user_id: &UserId, alias: Option<String>) -> CoreResult<()> {
        let record = self
            .get(user_id)
            .ok_or(CoreError::Protocol(ProtocolError::UnknownTag))?;
        let snapshot = {
            let mut meta = record.meta.write();
            meta.alias = alias;
            meta.clone()
        };
        self.persist_meta(vault, user_id, &snapshot)
    }

    /// `LookupByNick` (§4.G): alias → nick → hex-prefix-unambiguous match.
    pub fn lookup_by_nick(&self, query: &str) -> Option<UserId> {
        let peers = self.peers.read();
        for (uid, record) in peers.iter() {
            if record.meta.read().alias.as_deref() == Some(query) {
                return Some(*uid);
            }
        }
        for (uid, record) in peers.iter() {
            if record.meta.read().nick == query {
                return Some(*uid);
            }
        }
        let lower = query.to_ascii_lowercase();
        let mut matches: Vec<UserId> = peers
            .keys()
            .filter(|uid| hex::encode(*uid).starts_with(&lower))
            .copied()
            .collect();
        if matches.len() == 1 {
            return matches.pop();
        }
        None
    }

    /// Accepts alias, nick, or hex UID per §6's "user" argument resolution.
    pub fn resolve_user(&self, user: &str) -> CoreResult<UserId> {
        if let Ok(bytes) = hex::decode(user) {
            if let Ok(uid): Result<UserId, _> = bytes.try_into() {
                if self.contains(&uid) {
                    return Ok(uid);
                }
            }
        }
        self.lookup_by_nick(user)
            .ok_or(CoreError::Protocol(ProtocolError::UnknownTag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Vault;
    use tempfile::tempdir;

    fn fresh_ratchet() -> Ratchet {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        Ratchet::new(&[1u8; 32], true, 50, secret)
    }

    #[test]
    fn insert_then_lookup_by_nick_and_hex() {
        let dir = tempdir().unwrap();
        let mut vault = Vault::create_new(dir.path().join("identity"), "pw").unwrap();
        let registry = UserRegistry::load(&vault).unwrap();
        let uid = [5u8; 32];
        registry
            .insert(&mut vault, uid, "alice".to_string(), fresh_ratchet())
            .unwrap();
        assert_eq!(registry.lookup_by_nick("alice"), Some(uid));
        assert_eq!(registry.resolve_user(&hex::encode(uid)).unwrap(), uid);
    }

    #[test]
    fn reload_from_vault_restores_ratchet_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let mut vault = Vault::create_new(&path, "pw").unwrap();
        let registry = UserRegistry::load(&vault).unwrap();
        let uid = [9u8; 32];
        let mut ratchet = fresh_ratchet();
        ratchet.bootstrap_remote_dh([2u8; 32]);
        registry
            .insert(&mut vault, uid, "bob".to_string(), ratchet)
            .unwrap();

        let reopened = Vault::open(&path, "pw").unwrap();
        let reloaded = UserRegistry::load(&reopened).unwrap();
        assert!(reloaded.contains(&uid));
    }

    #[test]
    fn forget_removes_peer() {
        let dir = tempdir().unwrap();
        let mut vault = Vault::create_new(dir.path().join("identity"), "pw").unwrap();
        let registry = UserRegistry::load(&vault).unwrap();
        let uid = [3u8; 32];
        registry
            .insert(&mut vault, uid, "carol".to_string(), fresh_ratchet())
            .unwrap();
        registry.forget(&mut vault, &uid).unwrap();
        assert!(!registry.contains(&uid));
    }

    #[test]
    fn forget_then_reload_does_not_resurrect_peer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let mut vault = Vault::create_new(&path, "pw").unwrap();
        let registry = UserRegistry::load(&vault).unwrap();
        let uid = [4u8; 32];
        registry
            .insert(&mut vault, uid, "dave".to_string(), fresh_ratchet())
            .unwrap();
        registry.forget(&mut vault, &uid).unwrap();

        let reopened = Vault::open(&path, "pw").unwrap();
        let reloaded = UserRegistry::load(&reopened).unwrap();
        assert!(!reloaded.contains(&uid));
    }
}
