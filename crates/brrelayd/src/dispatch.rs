//! Inbound RV dispatch wiring (§4.D, §4.B, §4.G): registers, for every known
//! peer, a one-shot handler at that peer's next expected receive tag, and
//! re-installs the next one after each successful decrypt. Grounded on the
//! teacher's tamper-event dispatch in `engine/mod.rs` (decode, act, re-arm),
//! generalized from a single tamper channel to per-peer ratchet channels.

use crate::ipc_handler::record_inbound;
use crate::orchestrator::Core;
use crate::session::ClientFrame;
use brcore::gc::GcAccept;
use brcore::notify::CoreEvent;
use brcore::ratchet::RvTag;
use brcore::registry::UserId;
use brcore::wire::{decode, RoutedMessage};
use std::sync::Arc;
use tracing::warn;

/// Install (or re-install, after a successful receive) the one-shot handler
/// for `peer`'s next expected inbound message.
pub fn install_peer_handler(core: Arc<Core>, peer: UserId) {
    let Some(record) = core.registry.get(&peer) else {
        return;
    };
    let Some(tag) = record.ratchet.lock().next_tag_recv() else {
        return;
    };
    let core_for_handler = core.clone();
    let result = core.rv.register(tag, brcore::rv::HandlerKind::OneShot, false, move |tag, payload| {
        handle_inbound(core_for_handler.clone(), peer, tag, payload);
    });
    if let Err(e) = result {
        warn!(error = %e, peer = %hex::encode(peer), "failed to arm inbound rv handler");
    }
}

fn handle_inbound(core: Arc<Core>, peer: UserId, tag: RvTag, payload: Vec<u8>) {
    let Some(record) = core.registry.get(&peer) else {
        return;
    };

    let decrypted = {
        let mut ratchet = record.ratchet.lock();
        let result = ratchet.try_decrypt(tag, &payload);
        if result.is_ok() {
            let mut vault = core.vault.lock();
            if let Err(e) = core.registry.persist_ratchet(&mut vault, &peer, &ratchet) {
                warn!(error = %e, "failed to persist ratchet after successful decrypt");
            }
        }
        result
    };

    // Whether decrypt succeeded or failed, the peer's channel must stay
    // live: a failed decrypt leaves the ratchet untouched, so the very same
    // tag is still the next expected one.
    install_peer_handler(core.clone(), peer);

    let bytes = match decrypted {
        Ok(bytes) => bytes,
        Err(e) => {
            core.bus.publish(CoreEvent::RatchetDesync { peer });
            warn!(error = %e, peer = %hex::encode(peer), "failed to decrypt inbound rm");
            return;
        }
    };

    let envelope = match decode(&bytes) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed routed message");
            return;
        }
    };

    let sender_hex = hex::encode(peer);
    let sender_nick = record.meta.read().nick.clone();

    match envelope.message {
        RoutedMessage::GcInvite { gc_id, name, generation, members } => {
            core.gc.adopt(brcore::gc::GcMeta {
                gc_id,
                name,
                admin: peer,
                members,
                generation,
            });
        }
        RoutedMessage::GcListUpdate { gc_id, generation, members } => {
            match core.gc.check_generation(&gc_id, generation) {
                GcAccept::Accepted | GcAccept::NeedsMetadataFetch => {
                    if core.gc.get(&gc_id).is_none() {
                        core.gc.adopt(brcore::gc::GcMeta {
                            gc_id,
                            name: String::new(),
                            admin: peer,
                            members,
                            generation,
                        });
                    } else if let Err(e) = core.gc.apply_update(gc_id, members, generation) {
                        warn!(error = %e, "gc list update rejected");
                    }
                    core.bus.publish(CoreEvent::GcGenerationAdvanced { gc_id, generation });
                }
                GcAccept::DroppedStale => {}
            }
        }
        RoutedMessage::Gcm { gc_id, generation, .. } => {
            match core.gc.check_generation(&gc_id, generation) {
                GcAccept::Accepted => {
                    if let Err(e) = record_inbound(&core, sender_hex, sender_nick, envelope.message) {
                        warn!(error = %e, "failed to record inbound gcm");
                    }
                }
                GcAccept::DroppedStale => {}
                GcAccept::NeedsMetadataFetch => {
                    warn!(gc_id = %hex::encode(gc_id), "gcm generation ahead of cached metadata");
                }
            }
        }
        RoutedMessage::KxStep { ephemeral_pub, reply_rv } => {
            // Arriving as a sealed RM from an already-known peer, this is
            // always the proposer's half of a ratchet reset; we play the
            // responder side and post our ephemeral key back unsealed at
            // `reply_rv`, since no ratchet covers that tag yet.
            let (our_ephemeral_pub, our_secret) = core.kx.accept_reset(ephemeral_pub);
            let new_ratchet = core.kx.finish_reset(false, our_secret, ephemeral_pub);
            {
                let mut vault = core.vault.lock();
                if let Err(e) = core.registry.persist_ratchet(&mut vault, &peer, &new_ratchet) {
                    warn!(error = %e, "failed to persist reset ratchet");
                }
            }
            *record.ratchet.lock() = new_ratchet;
            core.bus.publish(CoreEvent::KxCompleted { peer });

            let core_for_push = core.clone();
            tokio::spawn(async move {
                let session = core_for_push.session.read().clone();
                if let Some(session) = session {
                    if let Err(e) = session
                        .submit(ClientFrame::Push {
                            rv: reply_rv,
                            payload: our_ephemeral_pub.to_vec(),
                            payment: None,
                        })
                        .await
                    {
                        warn!(error = %e, "failed to post ratchet reset reply");
                    }
                }
            });
        }
        RoutedMessage::MediateKx { target, invite } => {
            if let Some(target_record) = core.registry.get(&target) {
                let sender = peer;
                let plaintext = brcore::wire::encode(
                    sender,
                    RoutedMessage::MediateKx { target, invite },
                );
                let mut ratchet = target_record.ratchet.lock();
                if let Ok((tag, header, key)) = ratchet.next_tag_send() {
                    let sealed = brcore::ratchet::seal(&header, &key, &plaintext);
                    let mut vault = core.vault.lock();
                    let _ = core.registry.persist_ratchet(&mut vault, &target, &ratchet);
                    drop(vault);
                    let _ = core.outbox.enqueue(target, tag, sealed, 0, None);
                }
            } else {
                warn!("mediated kx target is not a known peer; dropping invite");
            }
        }
        RoutedMessage::Tip { dcr_amount } => {
            core.bus.publish(CoreEvent::PaymentSettled {
                invoice: format!("tip:{}:{dcr_amount}", hex::encode(peer)),
            });
        }
        RoutedMessage::TipProgress { .. } | RoutedMessage::Ping => {}
        RoutedMessage::FileTransfer { .. } => {
            // File transfer reassembly is out of scope for the core routing
            // surface; a future consumer layer owns chunk reassembly.
        }
        RoutedMessage::GcJoin { .. } => {}
        other => {
            if let Err(e) = record_inbound(&core, sender_hex, sender_nick, other) {
                warn!(error = %e, "failed to record inbound message");
            }
        }
    }
}
