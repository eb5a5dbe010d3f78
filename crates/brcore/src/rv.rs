//! Rendezvous manager (§4.D): owns `tag -> handler` and dispatches inbound
//! blobs from the server session to the right consumer. Grounded on the
//! control-plane session-registry pattern in `ipc.rs`
//! (`Arc<Mutex<HashMap<...>>>`), generalized to `parking_lot::RwLock` with
//! copy-on-read snapshots so handler invocation never races a concurrent
//! registration.

use crate::error::{CoreError, ProtocolError};
use crate::ratchet::RvTag;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a subscription survives its own firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Removed on first fire; used for the next expected inbound message.
    OneShot,
    /// Remains registered across firings (payment events, etc).
    Persistent,
}

/// A registered RV subscription. `paid` mirrors whether the subscription was
/// opened against a paid tag (§4.C `Subscribe(rv_tag, paid?)`).
pub struct Subscription {
    pub kind: HandlerKind,
    pub paid: bool,
    pub handler: Box<dyn Fn(RvTag, Vec<u8>) + Send + Sync>,
}

/// Copy-on-read tag -> handler map (§4.D, §5). Readers clone an `Arc` of the
/// current map rather than holding the lock across dispatch, so a slow or
/// panicking handler never blocks concurrent `register`/`unregister`.
#[derive(Default)]
pub struct RvManager {
    subs: parking_lot::RwLock<Arc<HashMap<[u8; 32], Arc<Subscription>>>>,
}

impl RvManager {
    pub fn new() -> Self {
        Self {
            subs: parking_lot::RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// MUST NOT register a tag already present — that indicates protocol
    /// desync (§4.D contract).
    pub fn register(
        &self,
        tag: RvTag,
        kind: HandlerKind,
        paid: bool,
        handler: impl Fn(RvTag, Vec<u8>) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        let mut guard = self.subs.write();
        if guard.contains_key(&tag.0) {
            return Err(CoreError::Protocol(ProtocolError::TagCollision));
        }
        let mut next = (**guard).clone();
        next.insert(
            tag.0,
            Arc::new(Subscription {
                kind,
                paid,
                handler: Box::new(handler),
            }),
        );
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn unregister(&self, tag: RvTag) {
        let mut guard = self.subs.write();
        if !guard.contains_key(&tag.0) {
            return;
        }
        let mut next = (**guard).clone();
        next.remove(&tag.0);
        *guard = Arc::new(next);
    }

    pub fn is_registered(&self, tag: RvTag) -> bool {
        self.subs.read().contains_key(&tag.0)
    }

    /// Dispatch a blob that arrived at `tag`. One-shot handlers are removed
    /// before invocation so a handler re-registering the same tag (e.g. the
    /// next ratchet step) never collides with itself.
    pub fn dispatch(&self, tag: RvTag, payload: Vec<u8>) -> Result<(), CoreError> {
        let snapshot = self.subs.read().clone();
        let Some(sub) = snapshot.get(&tag.0).cloned() else {
            return Err(CoreError::Protocol(ProtocolError::UnknownTag));
        };
        if sub.kind == HandlerKind::OneShot {
            self.unregister(tag);
        }
        (sub.handler)(tag, payload);
        Ok(())
    }

    /// All tags registered with `Persistent` kind, for re-subscription after
    /// a server reconnect (§4.C, §4.D: "re-registers all persistent tags on
    /// each server reconnect").
    pub fn persistent_tags(&self) -> Vec<(RvTag, bool)> {
        self.subs
            .read()
            .iter()
            .filter(|(_, s)| s.kind == HandlerKind::Persistent)
            .map(|(tag, s)| (RvTag(*tag), s.paid))
            .collect()
    }

    pub fn all_tags(&self) -> Vec<(RvTag, bool)> {
        self.subs
            .read()
            .iter()
            .map(|(tag, s)| (RvTag(*tag), s.paid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn duplicate_register_is_tag_collision() {
        let mgr = RvManager::new();
        let tag = RvTag([1u8; 32]);
        mgr.register(tag, HandlerKind::OneShot, false, |_, _| {}).unwrap();
        let err = mgr
            .register(tag, HandlerKind::OneShot, false, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(ProtocolError::TagCollision)));
    }

    #[test]
    fn one_shot_handler_fires_once() {
        let mgr = RvManager::new();
        let tag = RvTag([2u8; 32]);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        mgr.register(tag, HandlerKind::OneShot, false, move |_, _| {
            count2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        mgr.dispatch(tag, vec![]).unwrap();
        assert!(!mgr.is_registered(tag));
        assert!(mgr.dispatch(tag, vec![]).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistent_handler_survives_firing() {
        let mgr = RvManager::new();
        let tag = RvTag([3u8; 32]);
        mgr.register(tag, HandlerKind::Persistent, true, |_, _| {}).unwrap();
        mgr.dispatch(tag, vec![]).unwrap();
        assert!(mgr.is_registered(tag));
        assert_eq!(mgr.persistent_tags(), vec![(tag, true)]);
    }

    #[test]
    fn unknown_tag_dispatch_fails() {
        let mgr = RvManager::new();
        assert!(mgr.dispatch(RvTag([9u8; 32]), vec![]).is_err());
    }
}
