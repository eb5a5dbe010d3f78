//! Group-chat controller (§4.I): admin-authored membership generations and
//! broadcast fan-out. Grounded on the user registry (G) it looks peers up
//! through and the outbox (E) it drives — membership state itself has no
//! direct teacher analogue, so its accept/reject gate is modeled as a plain
//! guarded map in the same idiom as the rest of the core.

use crate::error::{CoreError, ProtocolError};
use crate::outbox::Outbox;
use crate::ratchet::RvTag;
use crate::registry::UserRegistry;
use crate::wire::{GcId, RoutedMessage, UserId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// GC metadata (§3): centrally authored by the admin, generation-gated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcMeta {
    pub gc_id: GcId,
    pub name: String,
    pub admin: UserId,
    pub members: Vec<UserId>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAccept {
    Accepted,
    DroppedStale,
    NeedsMetadataFetch,
}

/// One outcome of a broadcast fan-out attempt, per member (§4.I "partial
/// failures are allowed: delivery to each member is independent").
#[derive(Debug)]
pub struct FanoutResult {
    pub member: UserId,
    pub outcome: Result<(), CoreError>,
}

pub struct GcController {
    groups: RwLock<HashMap<GcId, GcMeta>>,
}

impl GcController {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Accept a brand-new invite, or an admin-issued list update, adopting
    /// its generation as the local cache (§3 GC metadata).
    pub fn adopt(&self, meta: GcMeta) {
        self.groups.write().insert(meta.gc_id, meta);
    }

    pub fn get(&self, gc_id: &GcId) -> Option<GcMeta> {
        self.groups.read().get(gc_id).cloned()
    }

    pub fn current_generation(&self, gc_id: &GcId) -> Option<u64> {
        self.groups.read().get(gc_id).map(|m| m.generation)
    }

    /// Gate an inbound GC message's generation against the locally cached
    /// one (§4.I): equal is accepted, lower is dropped, higher triggers a
    /// metadata-fetch request.
    pub fn check_generation(&self, gc_id: &GcId, generation: u64) -> GcAccept {
        match self.current_generation(gc_id) {
            None => GcAccept::NeedsMetadataFetch,
            Some(current) if generation == current => GcAccept::Accepted,
            Some(current) if generation < current => GcAccept::DroppedStale,
            Some(_) => GcAccept::NeedsMetadataFetch,
        }
    }

    /// Apply an admin-authored membership update. Only a strictly
    /// increasing generation is honored (§4.I invariant); a stale or
    /// duplicate update is a no-op.
    pub fn apply_update(&self, gc_id: GcId, members: Vec<UserId>, generation: u64) -> Result<(), CoreError> {
        let mut groups = self.groups.write();
        match groups.get_mut(&gc_id) {
            Some(meta) => {
                if generation <= meta.generation {
                    return Ok(());
                }
                meta.members = members;
                meta.generation = generation;
                Ok(())
            }
            None => Err(CoreError::Protocol(ProtocolError::UnknownTag)),
        }
    }

    /// Broadcast fan-out (§4.I): enqueue one outbox entry per member, using
    /// that member's own ratchet-sealed RM. `encode_for` must already have
    /// sealed the payload per-member (sealing requires each member's own
    /// ratchet step, so it is supplied by the caller, not performed here),
    /// and returns the one-shot `rv` tag that step was derived for alongside
    /// the ciphertext.
    pub fn fanout<F>(
        &self,
        gc_id: &GcId,
        registry: &UserRegistry,
        outbox: &Outbox,
        sender: UserId,
        mut encode_for: F,
    ) -> Result<Vec<FanoutResult>, CoreError>
    where
        F: FnMut(UserId) -> Result<(RvTag, Vec<u8>), CoreError>,
    {
        let members = self
            .get(gc_id)
            .ok_or(CoreError::Protocol(ProtocolError::UnknownTag))?
            .members;
        let mut results = Vec::with_capacity(members.len());
        for member in members {
            if member == sender {
                continue;
            }
            if !registry.contains(&member) {
                results.push(FanoutResult {
                    member,
                    outcome: Err(CoreError::Protocol(ProtocolError::UnknownTag)),
                });
                continue;
            }
            let outcome = encode_for(member).and_then(|(rv, bytes)| {
                outbox
                    .enqueue(member, rv, bytes, 0, None)
                    .map(|_| ())
            });
            results.push(FanoutResult { member, outcome });
        }
        Ok(results)
    }

    /// Helper for building the `RoutedMessage::GcListUpdate`/`GcInvite`
    /// variants fan-out pushes, independent of per-member sealing.
    pub fn list_update_message(meta: &GcMeta) -> RoutedMessage {
        RoutedMessage::GcListUpdate {
            gc_id: meta.gc_id,
            generation: meta.generation,
            members: meta.members.clone(),
        }
    }
}

impl Default for GcController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> GcMeta {
        GcMeta {
            gc_id: [1u8; 32],
            name: "test-gc".to_string(),
            admin: [9u8; 32],
            members: vec![[2u8; 32], [3u8; 32]],
            generation: 3,
        }
    }

    #[test]
    fn generation_gate_accepts_equal_drops_lower_fetches_higher() {
        let gc = GcController::new();
        gc.adopt(sample_meta());
        assert_eq!(gc.check_generation(&[1u8; 32], 3), GcAccept::Accepted);
        assert_eq!(gc.check_generation(&[1u8; 32], 2), GcAccept::DroppedStale);
        assert_eq!(gc.check_generation(&[1u8; 32], 4), GcAccept::NeedsMetadataFetch);
    }

    #[test]
    fn apply_update_requires_strictly_increasing_generation() {
        let gc = GcController::new();
        gc.adopt(sample_meta());
        gc.apply_update([1u8; 32], vec![[2u8; 32], [3u8; 32], [4u8; 32]], 2).unwrap();
        assert_eq!(gc.current_generation(&[1u8; 32]), Some(3));
        gc.apply_update([1u8; 32], vec![[2u8; 32], [3u8; 32], [4u8; 32]], 4).unwrap();
        assert_eq!(gc.current_generation(&[1u8; 32]), Some(4));
    }

    #[test]
    fn unknown_gc_id_check_needs_metadata_fetch() {
        let gc = GcController::new();
        assert_eq!(gc.check_generation(&[99u8; 32], 1), GcAccept::NeedsMetadataFetch);
    }
}
